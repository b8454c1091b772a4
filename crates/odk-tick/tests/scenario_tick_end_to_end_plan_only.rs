//! Scenario: full plan-only ticks against a seeded state directory.
//!
//! Two shapes: an empty book (NORMAL mode, an open intent is issued and
//! immediately consumed by the plan-only executor) and a held book with
//! fallback vols (DEGRADED mode, opens blocked, nothing to close).

use chrono::NaiveDate;
use odk_broker::{Broker, BrokerMode, PaperBroker};
use odk_gateway::VerticalIntent;
use odk_portfolio::{record_fill, MarketState, Side, UnderlierQuote};
use odk_state::{RiskMode, StateDir, GATE_OUT, MARKET_STATE, OPEN_INTENT, TICK_STATE};
use odk_tick::{run_tick, StageOutcome, TickConfig, TickOutcome, TickState};

fn seed_market(dir: &StateDir) {
    let mut m = MarketState::default();
    for (root, spot) in [("QQQ", 601.0), ("SPY", 685.0)] {
        m.symbols.insert(
            root.to_string(),
            UnderlierQuote {
                spot: Some(spot),
                spot_src: Some("TRADE".to_string()),
                bid: Some(spot - 0.05),
                ask: Some(spot + 0.05),
                quote_spread_pct: None,
                chain_contracts: Some(5000),
            },
        );
    }
    dir.write_json_atomic(MARKET_STATE, &m).unwrap();
}

fn intents() -> Vec<(String, VerticalIntent)> {
    vec![(
        "demo1".to_string(),
        VerticalIntent {
            underlier: "QQQ".to_string(),
            is_call: true,
            k_long: 600.0,
            k_short: 610.0,
            dte_days: 30,
            qty_requested: 10,
            r: 0.04,
            iv_long: 0.22,
            iv_short: 0.22,
            tag: "GATE_QQQ_600_610C".to_string(),
        },
    )]
}

fn broker() -> Broker<PaperBroker> {
    Broker::new(
        BrokerMode::PlanOnly,
        PaperBroker::new(NaiveDate::from_ymd_opt(2026, 2, 18).unwrap()),
    )
}

#[test]
fn empty_book_tick_issues_and_consumes_open_intent() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    seed_market(&dir);

    let state = run_tick(&dir, &TickConfig::default(), &intents(), &broker()).unwrap();

    assert!(state.ok, "halted_by = {:?}", state.halted_by);
    assert_eq!(state.state, TickOutcome::Ok);
    assert_eq!(state.steps.len(), 9);
    assert!(state.steps.iter().all(|s| s.ok), "steps: {:#?}", state.steps);

    // NORMAL mode, candidate allowed, so the issuer wrote an intent and the
    // plan-only executor consumed it within the same tick.
    let summary = &state.summary;
    assert_eq!(summary.risk_mode.as_ref().unwrap().mode, RiskMode::Normal);
    assert!(summary.gate_out_present);
    assert!(!summary.open_intent_present, "intent consumed by open-exec");
    assert!(!dir.exists(OPEN_INTENT));

    let open_exec = state.steps.iter().find(|s| s.name == "oms.open_exec").unwrap();
    assert_eq!(open_exec.outcome, StageOutcome::Ok);

    let on_disk: TickState = dir.read_json(TICK_STATE).unwrap().unwrap();
    assert_eq!(on_disk.steps.len(), state.steps.len());
}

#[test]
fn degraded_book_tick_blocks_opens_and_completes() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    seed_market(&dir);

    // A small held vertical; no option mids are known yet, so vols fall back
    // to the default and the evaluator degrades the mode. The two legs net
    // their greeks out, keeping totals inside the hard limits.
    record_fill(&dir, "QQQ300621C00600000", 2, Side::Buy, 4.10, "OMS_LONG_FILL_SIM").unwrap();
    record_fill(&dir, "QQQ300621C00610000", 2, Side::Sell, 2.20, "OMS_SHORT_FILL_SIM").unwrap();

    let state = run_tick(&dir, &TickConfig::default(), &intents(), &broker()).unwrap();

    assert!(state.ok);
    let summary = &state.summary;
    assert_eq!(summary.risk_mode.as_ref().unwrap().mode, RiskMode::Degraded);
    assert!(!summary.open_intent_present, "DEGRADED must not leave an open intent");

    let open = state.steps.iter().find(|s| s.name == "oms.open").unwrap();
    assert_eq!(open.outcome, StageOutcome::Reject);

    let close = state.steps.iter().find(|s| s.name == "oms.close").unwrap();
    assert_eq!(close.outcome, StageOutcome::NoInput);
}

#[test]
fn missing_market_state_still_completes_the_tick() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());

    let state = run_tick(&dir, &TickConfig::default(), &intents(), &broker()).unwrap();

    // First boot, quiet hours: no market data, no positions. Stages report
    // their own empty/no-input states; nothing is fatal.
    assert!(state.ok);
    let gateway = state.steps.iter().find(|s| s.name == "gateway").unwrap();
    assert!(gateway.ok);
    assert!(dir.exists(GATE_OUT));
    // The lone candidate was refused for missing quotes, so no intent.
    assert!(!state.summary.open_intent_present);
}
