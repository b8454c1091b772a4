//! Portfolio risk evaluator: compare greek totals to hard limits and decide
//! the trading mode.
//!
//! | condition                          | mode     | reason                        |
//! |------------------------------------|----------|-------------------------------|
//! | any `abs(total) > limit`           | HALT     | breaches, joined with `\|`    |
//! | else any row with fallback-default IV | DEGRADED | `IV_FALLBACK_DEFAULT_PRESENT` |
//! | otherwise                          | NORMAL   | `OK`                          |

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use odk_portfolio::{GreeksSnapshot, GreeksTotals, IvSource};
use odk_state::{utc_now, RiskMode, RiskModeStore, StateDir, PORTFOLIO_GREEKS, RISK_EVAL};

use crate::policy::RiskLimits;

/// Totals in both signed and absolute form, as written to `risk_eval.json`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvalTotals {
    pub abs_delta: f64,
    pub abs_gamma: f64,
    pub abs_vega: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

impl From<&GreeksTotals> for EvalTotals {
    fn from(t: &GreeksTotals) -> Self {
        Self {
            abs_delta: t.delta.abs(),
            abs_gamma: t.gamma.abs(),
            abs_vega: t.vega.abs(),
            delta: t.delta,
            gamma: t.gamma,
            vega: t.vega,
            theta: t.theta,
        }
    }
}

/// Decision breakdown written to `risk_eval.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEval {
    pub ts: DateTime<Utc>,
    pub mode_decision: RiskMode,
    pub reason: String,
    pub limits: RiskLimits,
    pub totals: EvalTotals,
    pub breaches: Vec<String>,
    pub iv_fallback_present: bool,
}

/// Breach strings for every axis over its hard limit.
pub fn compute_breaches(totals: &GreeksTotals, lim: &RiskLimits) -> Vec<String> {
    let mut breaches = Vec::new();
    if totals.delta.abs() > lim.max_abs_delta {
        breaches.push(format!(
            "DELTA_LIMIT {:.2} > {:.1}",
            totals.delta.abs(),
            lim.max_abs_delta
        ));
    }
    if totals.gamma.abs() > lim.max_abs_gamma {
        breaches.push(format!(
            "GAMMA_LIMIT {:.2} > {:.1}",
            totals.gamma.abs(),
            lim.max_abs_gamma
        ));
    }
    if totals.vega.abs() > lim.max_abs_vega {
        breaches.push(format!(
            "VEGA_LIMIT {:.2} > {:.1}",
            totals.vega.abs(),
            lim.max_abs_vega
        ));
    }
    breaches
}

fn has_iv_fallback(snap: &GreeksSnapshot) -> bool {
    snap.positions
        .iter()
        .any(|p| p.iv_src == IvSource::FallbackDefault)
}

/// Pure decision on a snapshot.
pub fn evaluate_snapshot(snap: &GreeksSnapshot, lim: &RiskLimits) -> RiskEval {
    let breaches = compute_breaches(&snap.totals, lim);
    let iv_fallback_present = has_iv_fallback(snap);

    let (mode, reason) = if !breaches.is_empty() {
        (RiskMode::Halt, breaches.join(" | "))
    } else if iv_fallback_present {
        (RiskMode::Degraded, "IV_FALLBACK_DEFAULT_PRESENT".to_string())
    } else {
        (RiskMode::Normal, "OK".to_string())
    };

    RiskEval {
        ts: utc_now(),
        mode_decision: mode,
        reason,
        limits: *lim,
        totals: EvalTotals::from(&snap.totals),
        breaches,
        iv_fallback_present,
    }
}

/// Read `portfolio_greeks.json`, decide, and atomically rewrite both
/// `risk_eval.json` and `risk_mode.json`. A missing greeks snapshot
/// evaluates as an empty portfolio (NORMAL / OK); first boot is quiet, not
/// fatal.
pub fn evaluate_portfolio(dir: &StateDir, lim: &RiskLimits) -> Result<RiskEval> {
    let snap: GreeksSnapshot = dir
        .read_json(PORTFOLIO_GREEKS)?
        .unwrap_or_else(|| GreeksSnapshot {
            ts: utc_now(),
            positions: Vec::new(),
            totals: GreeksTotals::default(),
        });

    let eval = evaluate_snapshot(&snap, lim);
    dir.write_json_atomic(RISK_EVAL, &eval)?;
    RiskModeStore::new(dir).set(eval.mode_decision, eval.reason.clone())?;
    Ok(eval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use odk_portfolio::PositionGreeksRow;
    use chrono::NaiveDate;

    fn snap_with_totals(delta: f64, gamma: f64, vega: f64) -> GreeksSnapshot {
        GreeksSnapshot {
            ts: utc_now(),
            positions: Vec::new(),
            totals: GreeksTotals {
                delta,
                gamma,
                vega,
                theta: 0.0,
            },
        }
    }

    fn fallback_row() -> PositionGreeksRow {
        PositionGreeksRow {
            symbol: "QQQ260320C00600000".into(),
            underlier: "QQQ".into(),
            exp: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            is_call: true,
            strike: 600.0,
            spot: Some(600.0),
            spot_src: Some("MID".into()),
            net_qty: 1,
            mid: 0.0,
            spr_pct: 0.0,
            iv: 0.25,
            iv_src: IvSource::FallbackDefault,
            delta: 50.0,
            gamma: 1.0,
            vega: 60.0,
            theta: -20.0,
        }
    }

    #[test]
    fn over_delta_limit_halts_with_breach_string() {
        let eval = evaluate_snapshot(&snap_with_totals(250.0, 2.0, 1000.0), &RiskLimits::default());
        assert_eq!(eval.mode_decision, RiskMode::Halt);
        assert!(eval.reason.contains("DELTA_LIMIT 250.00 > 200.0"), "{}", eval.reason);
        assert_eq!(eval.breaches.len(), 1);
    }

    #[test]
    fn multiple_breaches_join_all() {
        let eval =
            evaluate_snapshot(&snap_with_totals(-300.0, 50.0, 25_000.0), &RiskLimits::default());
        assert_eq!(eval.mode_decision, RiskMode::Halt);
        assert_eq!(eval.breaches.len(), 3);
        assert!(eval.reason.contains(" | "));
        // Negative totals breach on absolute value.
        assert!(eval.reason.contains("DELTA_LIMIT 300.00"));
    }

    #[test]
    fn iv_fallback_degrades_when_inside_limits() {
        let mut snap = snap_with_totals(50.0, 1.0, 500.0);
        snap.positions.push(fallback_row());
        let eval = evaluate_snapshot(&snap, &RiskLimits::default());
        assert_eq!(eval.mode_decision, RiskMode::Degraded);
        assert_eq!(eval.reason, "IV_FALLBACK_DEFAULT_PRESENT");
        assert!(eval.iv_fallback_present);
    }

    #[test]
    fn limits_breach_outranks_iv_fallback() {
        let mut snap = snap_with_totals(250.0, 1.0, 500.0);
        snap.positions.push(fallback_row());
        let eval = evaluate_snapshot(&snap, &RiskLimits::default());
        assert_eq!(eval.mode_decision, RiskMode::Halt);
    }

    #[test]
    fn inside_limits_is_normal_ok() {
        let eval = evaluate_snapshot(&snap_with_totals(100.0, 5.0, 10_000.0), &RiskLimits::default());
        assert_eq!(eval.mode_decision, RiskMode::Normal);
        assert_eq!(eval.reason, "OK");
    }

    #[test]
    fn exactly_at_limit_is_not_a_breach() {
        let eval = evaluate_snapshot(&snap_with_totals(200.0, 10.0, 20_000.0), &RiskLimits::default());
        assert_eq!(eval.mode_decision, RiskMode::Normal);
    }

    #[test]
    fn evaluate_writes_both_state_files() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        sd.write_json_atomic(PORTFOLIO_GREEKS, &snap_with_totals(250.0, 0.0, 0.0))
            .unwrap();

        let eval = evaluate_portfolio(&sd, &RiskLimits::default()).unwrap();
        assert_eq!(eval.mode_decision, RiskMode::Halt);

        let mode = RiskModeStore::new(&sd).load();
        assert_eq!(mode.mode, RiskMode::Halt);
        assert!(sd.exists(RISK_EVAL));
    }

    #[test]
    fn missing_greeks_is_quiet_normal() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let eval = evaluate_portfolio(&sd, &RiskLimits::default()).unwrap();
        assert_eq!(eval.mode_decision, RiskMode::Normal);
    }
}
