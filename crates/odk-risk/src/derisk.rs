//! De-risk planner and plan→intent executor.
//!
//! When portfolio totals breach the buffered target band the planner
//! synthesizes a minimal sequence of single-contract, reduce-only closes,
//! greedily ranked by how much each contract pulls the most-violated axes
//! back toward zero. The executor turns a non-empty plan into a durable
//! `close_intent.json` for the CLOSE side of the OMS.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use odk_portfolio::{GreeksSnapshot, GreeksTotals, Side};
use odk_state::{
    utc_now, RiskMode, RiskModeStore, StateDir, CLOSE_INTENT, DERISK_EXEC, DERISK_PLAN,
    PORTFOLIO_GREEKS,
};

use crate::policy::RiskLimits;

pub const DEFAULT_BUFFER_PCT: f64 = 0.90;
pub const DEFAULT_MAX_CONTRACTS_TO_CLOSE: i64 = 500;

/// Score weights: vega violations dominate, then gamma, then delta.
/// Calibrated against vega-per-1.00-vol units; do not retune one without
/// the other.
const W_VEGA: f64 = 5.0;
const W_GAMMA: f64 = 3.0;
const W_DELTA: f64 = 1.0;

/// One aggregated reduce-only close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAction {
    pub symbol: String,
    pub close_side: Side,
    pub qty: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeriskStatus {
    /// Totals already inside the buffered band.
    NoAction,
    /// Planned closes bring totals inside the band.
    Ok,
    /// Bounded reduction ran out before reaching the band.
    Partial,
}

/// The `derisk_plan.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriskPlan {
    pub ts: DateTime<Utc>,
    pub status: DeriskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub hard_limits: RiskLimits,
    pub target_limits: RiskLimits,
    pub buffer_pct: f64,
    pub start_totals: GreeksTotals,
    pub end_totals: GreeksTotals,
    pub actions: Vec<CloseAction>,
}

fn buffered(hard: &RiskLimits, buffer_pct: f64) -> RiskLimits {
    RiskLimits {
        max_abs_delta: hard.max_abs_delta * buffer_pct,
        max_abs_gamma: hard.max_abs_gamma * buffer_pct,
        max_abs_vega: hard.max_abs_vega * buffer_pct,
    }
}

fn within(t: &GreeksTotals, lim: &RiskLimits) -> bool {
    t.delta.abs() <= lim.max_abs_delta
        && t.gamma.abs() <= lim.max_abs_gamma
        && t.vega.abs() <= lim.max_abs_vega
}

/// Working copy of one position while planning.
#[derive(Debug, Clone)]
struct WorkRow {
    symbol: String,
    net_qty: i64,
    // Per-contract greeks (position-weighted row divided by net_qty).
    pc_delta: f64,
    pc_gamma: f64,
    pc_vega: f64,
}

impl WorkRow {
    /// Effect on totals of closing ONE contract of this position. A long
    /// subtracts its per-contract greeks, a short adds them; either way the
    /// position's own axes move toward zero.
    fn close_one_effect(&self) -> (f64, f64, f64) {
        let dir = if self.net_qty > 0 { 1.0 } else { -1.0 };
        (-self.pc_delta * dir, -self.pc_gamma * dir, -self.pc_vega * dir)
    }
}

fn reduction(total: f64, delta: f64) -> f64 {
    (total.abs() - (total + delta).abs()).max(0.0)
}

fn score(row: &WorkRow, totals: &GreeksTotals, target: &RiskLimits) -> f64 {
    let d_over = (totals.delta.abs() - target.max_abs_delta).max(0.0);
    let g_over = (totals.gamma.abs() - target.max_abs_gamma).max(0.0);
    let v_over = (totals.vega.abs() - target.max_abs_vega).max(0.0);

    let (ed, eg, ev) = row.close_one_effect();
    let d_red = reduction(totals.delta, ed);
    let g_red = reduction(totals.gamma, eg);
    let v_red = reduction(totals.vega, ev);

    W_VEGA * v_over * v_red + W_GAMMA * g_over * g_red + W_DELTA * d_over * d_red
}

/// Greedy reduce-only planning over a greeks snapshot.
pub fn build_derisk_plan(
    snap: &GreeksSnapshot,
    hard_limits: &RiskLimits,
    buffer_pct: f64,
    max_contracts_to_close: i64,
) -> DeriskPlan {
    let target = buffered(hard_limits, buffer_pct);
    let start = snap.totals;
    let mut totals = snap.totals;

    if within(&totals, &target) {
        return DeriskPlan {
            ts: utc_now(),
            status: DeriskStatus::NoAction,
            reason: Some("WITHIN_TARGET_LIMITS".to_string()),
            hard_limits: *hard_limits,
            target_limits: target,
            buffer_pct,
            start_totals: start,
            end_totals: totals,
            actions: Vec::new(),
        };
    }

    // Per-contract greeks are the position-weighted row divided by net_qty;
    // flat rows cannot be normalized and are excluded up front.
    let mut work: BTreeMap<String, WorkRow> = snap
        .positions
        .iter()
        .filter(|p| p.net_qty != 0)
        .map(|p| {
            let nq = p.net_qty as f64;
            (
                p.symbol.clone(),
                WorkRow {
                    symbol: p.symbol.clone(),
                    net_qty: p.net_qty,
                    pc_delta: p.delta / nq,
                    pc_gamma: p.gamma / nq,
                    pc_vega: p.vega / nq,
                },
            )
        })
        .collect();

    let mut planned: BTreeMap<String, CloseAction> = BTreeMap::new();
    let mut closed = 0i64;

    while closed < max_contracts_to_close && !within(&totals, &target) && !work.is_empty() {
        let best = work
            .values()
            .max_by(|a, b| {
                score(a, &totals, &target)
                    .partial_cmp(&score(b, &totals, &target))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .expect("work is non-empty");

        if score(&best, &totals, &target) <= 0.0 {
            break;
        }

        let close_side = if best.net_qty > 0 { Side::Sell } else { Side::Buy };
        let (ed, eg, ev) = best.close_one_effect();
        totals.delta += ed;
        totals.gamma += eg;
        totals.vega += ev;

        planned
            .entry(best.symbol.clone())
            .and_modify(|a| a.qty += 1)
            .or_insert(CloseAction {
                symbol: best.symbol.clone(),
                close_side,
                qty: 1,
            });

        let row = work.get_mut(&best.symbol).expect("row present");
        row.net_qty -= if row.net_qty > 0 { 1 } else { -1 };
        if row.net_qty == 0 {
            work.remove(&best.symbol);
        }

        closed += 1;
    }

    let status = if within(&totals, &target) {
        DeriskStatus::Ok
    } else {
        DeriskStatus::Partial
    };

    DeriskPlan {
        ts: utc_now(),
        status,
        reason: None,
        hard_limits: *hard_limits,
        target_limits: target,
        buffer_pct,
        start_totals: start,
        end_totals: totals,
        actions: planned.into_values().collect(),
    }
}

/// Read the greeks snapshot, plan, and atomically write `derisk_plan.json`.
///
/// Partial-success downgrade: when the portfolio was over the band and the
/// planner could schedule closes, the risk mode moves to DEGRADED (reduce
/// only) so subsequent ticks can make progress; when nothing is closeable it
/// pins HALT. A NoAction plan leaves the mode to the evaluator.
pub fn run_derisk_plan(
    dir: &StateDir,
    hard_limits: &RiskLimits,
    buffer_pct: f64,
    max_contracts_to_close: i64,
) -> Result<DeriskPlan> {
    let snap: GreeksSnapshot = dir
        .read_json(PORTFOLIO_GREEKS)?
        .unwrap_or_else(|| GreeksSnapshot {
            ts: utc_now(),
            positions: Vec::new(),
            totals: GreeksTotals::default(),
        });
    let plan = build_derisk_plan(&snap, hard_limits, buffer_pct, max_contracts_to_close);
    dir.write_json_atomic(DERISK_PLAN, &plan)?;

    let store = RiskModeStore::new(dir);
    match plan.status {
        DeriskStatus::NoAction => {}
        _ if !plan.actions.is_empty() => {
            let qty: i64 = plan.actions.iter().map(|a| a.qty).sum();
            store.set(RiskMode::Degraded, format!("DERISK_ALLOWED_QTY={qty}"))?;
        }
        _ => {
            store.set(RiskMode::Halt, "DERISK_NO_CLOSES_FEASIBLE")?;
        }
    }

    tracing::info!(status = ?plan.status, actions = plan.actions.len(), "de-risk plan written");
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Plan → close intent
// ---------------------------------------------------------------------------

/// The `close_intent.json` record, consumed exactly once by the CLOSE
/// executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseIntent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: String,
    pub actions: Vec<CloseAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_end_totals: Option<GreeksTotals>,
    pub hard_limits: RiskLimits,
    pub target_limits: RiskLimits,
    pub buffer_pct: f64,
}

pub const CLOSE_INTENT_KIND: &str = "DERISK_CLOSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeriskExecStatus {
    NoExec,
    WroteIntent,
}

/// The `derisk_exec.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriskExecOut {
    pub ts: DateTime<Utc>,
    pub status: DeriskExecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub deleted_stale_intent: bool,
    pub actions: Vec<CloseAction>,
}

/// Convert the latest plan into a close intent. A plan without actions
/// deletes any stale intent instead; the OMS must never act on
/// instructions from a previous breach.
pub fn execute_derisk_plan(dir: &StateDir) -> Result<DeriskExecOut> {
    let plan: Option<DeriskPlan> = dir.read_json(DERISK_PLAN)?;

    let Some(plan) = plan else {
        let deleted = dir.delete(CLOSE_INTENT)?;
        let out = DeriskExecOut {
            ts: utc_now(),
            status: DeriskExecStatus::NoExec,
            reason: Some("NO_PLAN".to_string()),
            deleted_stale_intent: deleted,
            actions: Vec::new(),
        };
        dir.write_json_atomic(DERISK_EXEC, &out)?;
        return Ok(out);
    };

    let actionable = matches!(plan.status, DeriskStatus::Ok | DeriskStatus::Partial)
        && !plan.actions.is_empty();

    if !actionable {
        let deleted = dir.delete(CLOSE_INTENT)?;
        let out = DeriskExecOut {
            ts: utc_now(),
            status: DeriskExecStatus::NoExec,
            reason: Some("NO_ACTIONS".to_string()),
            deleted_stale_intent: deleted,
            actions: Vec::new(),
        };
        dir.write_json_atomic(DERISK_EXEC, &out)?;
        if deleted {
            tracing::info!("stale close intent deleted");
        }
        return Ok(out);
    }

    let intent = CloseIntent {
        ts: utc_now(),
        kind: CLOSE_INTENT_KIND.to_string(),
        mode: "PLAN_ONLY".to_string(),
        actions: plan.actions.clone(),
        expected_end_totals: Some(plan.end_totals),
        hard_limits: plan.hard_limits,
        target_limits: plan.target_limits,
        buffer_pct: plan.buffer_pct,
    };
    dir.write_json_atomic(CLOSE_INTENT, &intent)?;

    let out = DeriskExecOut {
        ts: utc_now(),
        status: DeriskExecStatus::WroteIntent,
        reason: None,
        deleted_stale_intent: false,
        actions: plan.actions,
    };
    dir.write_json_atomic(DERISK_EXEC, &out)?;
    tracing::info!(actions = out.actions.len(), "close intent written");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use odk_portfolio::PositionGreeksRow;
    use chrono::NaiveDate;

    fn row(symbol: &str, net_qty: i64, delta: f64, gamma: f64, vega: f64) -> PositionGreeksRow {
        PositionGreeksRow {
            symbol: symbol.into(),
            underlier: "QQQ".into(),
            exp: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            is_call: true,
            strike: 600.0,
            spot: Some(600.0),
            spot_src: Some("MID".into()),
            net_qty,
            mid: 1.0,
            spr_pct: 1.0,
            iv: 0.2,
            iv_src: odk_portfolio::IvSource::Newton,
            delta,
            gamma,
            vega,
            theta: 0.0,
        }
    }

    fn snap(rows: Vec<PositionGreeksRow>) -> GreeksSnapshot {
        let mut totals = GreeksTotals::default();
        for r in &rows {
            totals.delta += r.delta;
            totals.gamma += r.gamma;
            totals.vega += r.vega;
        }
        GreeksSnapshot {
            ts: utc_now(),
            positions: rows,
            totals,
        }
    }

    #[test]
    fn within_band_is_no_action() {
        let s = snap(vec![row("QQQ260320C00600000", 2, 100.0, 2.0, 500.0)]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        assert_eq!(plan.status, DeriskStatus::NoAction);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.target_limits.max_abs_delta, 180.0);
    }

    #[test]
    fn over_delta_plans_sells_on_long_position() {
        // 6 contracts, 50 delta each => 300 total; band is 180.
        let s = snap(vec![row("QQQ260320C00600000", 6, 300.0, 3.0, 600.0)]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        assert_eq!(plan.status, DeriskStatus::Ok);
        assert_eq!(plan.actions.len(), 1);
        let a = &plan.actions[0];
        assert_eq!(a.close_side, Side::Sell);
        // 300 -> 150 takes 3 contracts of 50.
        assert_eq!(a.qty, 3);
        assert!(plan.end_totals.delta.abs() <= 180.0);
    }

    #[test]
    fn short_position_closes_with_buys() {
        let s = snap(vec![row("QQQ260320P00580000", -6, -300.0, 3.0, 600.0)]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        assert_eq!(plan.actions[0].close_side, Side::Buy);
        assert!(plan.end_totals.delta.abs() <= 180.0);
    }

    #[test]
    fn per_axis_reduction_is_monotonic_each_step() {
        // Replay the greedy loop step by step and assert every action
        // never increases any axis magnitude.
        let s = snap(vec![
            row("QQQ260320C00600000", 4, 240.0, 4.0, 9_000.0),
            row("SPY260320C00680000", 3, 120.0, 9.0, 15_000.0),
        ]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        assert_ne!(plan.status, DeriskStatus::NoAction);

        let mut totals = s.totals;
        for a in &plan.actions {
            let r = s.positions.iter().find(|p| p.symbol == a.symbol).unwrap();
            let nq = r.net_qty as f64;
            let dir = if r.net_qty > 0 { 1.0 } else { -1.0 };
            for _ in 0..a.qty {
                let next = GreeksTotals {
                    delta: totals.delta - r.delta / nq * dir,
                    gamma: totals.gamma - r.gamma / nq * dir,
                    vega: totals.vega - r.vega / nq * dir,
                    theta: totals.theta,
                };
                assert!(next.delta.abs() <= totals.delta.abs() + 1e-9);
                assert!(next.gamma.abs() <= totals.gamma.abs() + 1e-9);
                assert!(next.vega.abs() <= totals.vega.abs() + 1e-9);
                totals = next;
            }
        }
    }

    #[test]
    fn bounded_reduction_reports_partial() {
        let s = snap(vec![row("QQQ260320C00600000", 400, 20_000.0, 4.0, 8_000.0)]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 10);
        assert_eq!(plan.status, DeriskStatus::Partial);
        let total_qty: i64 = plan.actions.iter().map(|a| a.qty).sum();
        assert_eq!(total_qty, 10);
        assert!(plan.end_totals.delta.abs() < plan.start_totals.delta.abs());
    }

    #[test]
    fn vega_violation_outranks_delta_violation() {
        // Both axes over band; the vega-heavy position must be closed first.
        let s = snap(vec![
            row("VEGAHVY260320C00600000", 2, 10.0, 0.0, 40_000.0),
            row("DELTAHV260320C00600000", 2, 400.0, 0.0, 10.0),
        ]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 1);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].symbol, "VEGAHVY260320C00600000");
    }

    #[test]
    fn flat_rows_are_excluded() {
        let mut s = snap(vec![row("QQQ260320C00600000", 6, 300.0, 3.0, 600.0)]);
        s.positions.push(row("SPY260320C00680000", 0, 0.0, 0.0, 0.0));
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        assert!(plan.actions.iter().all(|a| a.symbol != "SPY260320C00680000"));
    }

    #[test]
    fn exec_writes_intent_for_actionable_plan() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let s = snap(vec![row("QQQ260320C00600000", 6, 300.0, 3.0, 600.0)]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        sd.write_json_atomic(DERISK_PLAN, &plan).unwrap();

        let out = execute_derisk_plan(&sd).unwrap();
        assert_eq!(out.status, DeriskExecStatus::WroteIntent);
        let intent: CloseIntent = sd.read_json(CLOSE_INTENT).unwrap().unwrap();
        assert_eq!(intent.kind, CLOSE_INTENT_KIND);
        assert_eq!(intent.actions, plan.actions);
    }

    #[test]
    fn exec_without_actions_deletes_stale_intent() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        // A leftover intent from an earlier breach.
        let stale = CloseIntent {
            ts: utc_now(),
            kind: CLOSE_INTENT_KIND.to_string(),
            mode: "PLAN_ONLY".to_string(),
            actions: vec![CloseAction {
                symbol: "QQQ260320C00600000".into(),
                close_side: Side::Sell,
                qty: 1,
            }],
            expected_end_totals: None,
            hard_limits: RiskLimits::default(),
            target_limits: RiskLimits::default(),
            buffer_pct: DEFAULT_BUFFER_PCT,
        };
        sd.write_json_atomic(CLOSE_INTENT, &stale).unwrap();

        let s = snap(vec![row("QQQ260320C00600000", 1, 50.0, 1.0, 100.0)]);
        let plan = build_derisk_plan(&s, &RiskLimits::default(), DEFAULT_BUFFER_PCT, 500);
        sd.write_json_atomic(DERISK_PLAN, &plan).unwrap();

        let out = execute_derisk_plan(&sd).unwrap();
        assert_eq!(out.status, DeriskExecStatus::NoExec);
        assert!(out.deleted_stale_intent);
        assert!(!sd.exists(CLOSE_INTENT));
    }
}
