//! Scenario: DEGRADED when greeks carry fallback-default vols.
//!
//! All totals inside limits, but one position row solved no IV and fell
//! back to the configured default: the system must degrade (reduce-only),
//! not halt.

use chrono::NaiveDate;
use odk_portfolio::{GreeksSnapshot, GreeksTotals, IvSource, PositionGreeksRow};
use odk_risk::{evaluate_portfolio, RiskLimits};
use odk_state::{utc_now, RiskMode, RiskModeStore, StateDir, PORTFOLIO_GREEKS};

fn row(symbol: &str, iv_src: IvSource) -> PositionGreeksRow {
    PositionGreeksRow {
        symbol: symbol.to_string(),
        underlier: "QQQ".to_string(),
        exp: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
        is_call: true,
        strike: 600.0,
        spot: Some(601.0),
        spot_src: Some("MID".to_string()),
        net_qty: 1,
        mid: 4.0,
        spr_pct: 1.0,
        iv: 0.25,
        iv_src,
        delta: 50.0,
        gamma: 1.0,
        vega: 60.0,
        theta: -25.0,
    }
}

fn snapshot(rows: Vec<PositionGreeksRow>) -> GreeksSnapshot {
    let mut totals = GreeksTotals::default();
    for r in &rows {
        totals.delta += r.delta;
        totals.gamma += r.gamma;
        totals.vega += r.vega;
        totals.theta += r.theta;
    }
    GreeksSnapshot {
        ts: utc_now(),
        positions: rows,
        totals,
    }
}

#[test]
fn one_fallback_row_degrades_inside_limits() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    dir.write_json_atomic(
        PORTFOLIO_GREEKS,
        &snapshot(vec![
            row("QQQ260320C00600000", IvSource::Newton),
            row("QQQ260320C00610000", IvSource::FallbackDefault),
        ]),
    )
    .unwrap();

    let eval = evaluate_portfolio(&dir, &RiskLimits::default()).unwrap();
    assert_eq!(eval.mode_decision, RiskMode::Degraded);
    assert_eq!(eval.reason, "IV_FALLBACK_DEFAULT_PRESENT");
    assert!(eval.iv_fallback_present);
    assert!(eval.breaches.is_empty());
    assert_eq!(RiskModeStore::new(&dir).load().mode, RiskMode::Degraded);
}

#[test]
fn solved_vols_keep_normal() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    dir.write_json_atomic(
        PORTFOLIO_GREEKS,
        &snapshot(vec![
            row("QQQ260320C00600000", IvSource::Newton),
            row("QQQ260320C00610000", IvSource::Bisect),
        ]),
    )
    .unwrap();

    let eval = evaluate_portfolio(&dir, &RiskLimits::default()).unwrap();
    assert_eq!(eval.mode_decision, RiskMode::Normal);
    assert_eq!(eval.reason, "OK");
    assert!(!eval.iv_fallback_present);
}
