//! Scenario: the bounded de-risk loop walks a breached portfolio back
//! inside the buffered band.
//!
//! A heavy long call position blows through the vega and delta limits, so
//! the first evaluation halts. Each round then plans reduce-only closes,
//! publishes the partial-success downgrade, and executes them; the book
//! shrinks monotonically until the mode leaves HALT or the round cap hits.

use odk_portfolio::{load_book, record_fill, MarketState, Side, UnderlierQuote};
use odk_state::{RiskMode, StateDir, MARKET_STATE};
use odk_tick::{run_derisk_loop, DeriskLoopConfig};

// Far-dated expiries keep the scenarios stable against the wall clock.
const HEAVY_SYMBOL: &str = "QQQ300621C00600000";
const LIGHT_SYMBOL: &str = "XLU300621C00080000";

fn seed(dir: &StateDir, symbol: &str, root: &str, spot: f64, qty: i64) {
    let mut m = MarketState::default();
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
    dir.write_json_atomic(MARKET_STATE, &m).unwrap();

    record_fill(dir, symbol, qty, Side::Buy, 4.10, "OMS_LONG_FILL_SIM").unwrap();
    odk_portfolio::rebuild_positions_book(dir).unwrap();
}

#[test]
fn breached_portfolio_is_reduced_until_mode_leaves_halt() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    // Long-dated 600-strike calls carry tens of thousands of dollars of
    // vega per contract; 300 of them are far beyond every limit.
    seed(&dir, HEAVY_SYMBOL, "QQQ", 601.0, 300);

    let report = run_derisk_loop(&dir, &DeriskLoopConfig::default()).unwrap();

    assert_eq!(report.rounds[0].mode, RiskMode::Halt, "first round must see the breach");
    assert!(!report.rounds[0].breaches.is_empty());

    assert_ne!(report.final_mode, RiskMode::Halt, "rounds: {:#?}", report.rounds);
    assert!(report.rounds.len() >= 2, "at least one reduction round");

    let book = load_book(&dir).unwrap();
    let remaining = book.get(HEAVY_SYMBOL).copied().unwrap_or(0);
    assert!(remaining < 300, "book must have shrunk, still {remaining}");
    assert!(remaining >= 0, "reduce-only must never flip the sign");
}

#[test]
fn healthy_portfolio_exits_after_one_round() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    // One contract on a small-dollar underlier stays well inside limits.
    seed(&dir, LIGHT_SYMBOL, "XLU", 80.0, 1);

    let report = run_derisk_loop(&dir, &DeriskLoopConfig::default()).unwrap();
    assert_eq!(report.rounds.len(), 1);
    assert_ne!(report.final_mode, RiskMode::Halt);

    // Nothing was closed.
    assert_eq!(load_book(&dir).unwrap().get(LIGHT_SYMBOL), Some(&1));
}

#[test]
fn round_cap_bounds_the_loop() {
    let td = tempfile::tempdir().unwrap();
    let dir = StateDir::new(td.path());
    seed(&dir, HEAVY_SYMBOL, "QQQ", 601.0, 300);

    let cfg = DeriskLoopConfig {
        // One contract per round cannot reach the band in two rounds.
        max_contracts_to_close: 1,
        max_rounds: 2,
        ..DeriskLoopConfig::default()
    };
    let report = run_derisk_loop(&dir, &cfg).unwrap();
    assert_eq!(report.rounds.len(), 2);
    assert_eq!(report.final_mode, RiskMode::Halt);

    // Two rounds, one contract closed in each.
    assert_eq!(load_book(&dir).unwrap().get(HEAVY_SYMBOL), Some(&298));
}
