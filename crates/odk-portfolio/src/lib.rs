//! Positions ledger and portfolio greeks.
//!
//! The fills log (`positions.jsonl`) is append-only truth; the positions book
//! is a pure fold over it. The greeks builder joins the book with market
//! state and the previous greeks snapshot, back-solving implied vols per
//! position and accumulating portfolio totals.

mod greeks;
mod ledger;
mod types;

pub use greeks::{build_portfolio_greeks, build_snapshot, GreeksConfig};
pub use ledger::{load_book, record_fill, rebuild_positions_book};
pub use types::{
    Fill, GreeksSnapshot, GreeksTotals, IvSource, LedgerEventKind, MarketState, PositionGreeksRow,
    PositionRow, PositionsBook, Side, UnderlierQuote,
};
