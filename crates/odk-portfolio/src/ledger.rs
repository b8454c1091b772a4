//! Append-only fills log and the book fold.

use anyhow::Result;
use std::collections::BTreeMap;

use odk_state::{utc_now, StateDir, POSITIONS_BOOK, POSITIONS_LOG};

use crate::types::{Fill, LedgerEventKind, PositionsBook, Side};

/// Append one fill line to `positions.jsonl`. The log is never rewritten.
pub fn record_fill(
    dir: &StateDir,
    symbol: &str,
    qty: i64,
    side: Side,
    price: f64,
    tag: &str,
) -> Result<Fill> {
    debug_assert!(qty > 0, "fill qty must be positive");
    let fill = Fill {
        ts: utc_now(),
        kind: LedgerEventKind::Fill,
        symbol: symbol.to_string(),
        qty,
        side,
        price,
        tag: tag.to_string(),
    };
    dir.append_jsonl(POSITIONS_LOG, &fill)?;
    Ok(fill)
}

/// Fold the fills log into net positions: BUY adds, SELL subtracts, unknown
/// sides and non-FILL lines are ignored, flat symbols are dropped.
///
/// Pure function of the log: rebuilding is deterministic and idempotent.
pub fn load_book(dir: &StateDir) -> Result<BTreeMap<String, i64>> {
    let fills: Vec<Fill> = dir.read_jsonl(POSITIONS_LOG)?;
    let mut book: BTreeMap<String, i64> = BTreeMap::new();

    for f in &fills {
        if f.kind != LedgerEventKind::Fill {
            continue;
        }
        let sign = match f.side {
            Side::Buy => 1,
            Side::Sell => -1,
            Side::Unknown => continue,
        };
        *book.entry(f.symbol.clone()).or_insert(0) += sign * f.qty;
    }

    book.retain(|_, q| *q != 0);
    Ok(book)
}

/// Rebuild `positions_book.json` from the fills log and write it atomically.
pub fn rebuild_positions_book(dir: &StateDir) -> Result<PositionsBook> {
    let book = load_book(dir)?;
    let snap = PositionsBook::from_map(utc_now(), &book);
    dir.write_json_atomic(POSITIONS_BOOK, &snap)?;
    tracing::info!(positions = snap.positions.len(), "positions book rebuilt");
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> (tempfile::TempDir, StateDir) {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        (td, sd)
    }

    #[test]
    fn buys_and_sells_net_out() {
        let (_td, sd) = dir();
        record_fill(&sd, "QQQ260320C00600000", 3, Side::Buy, 4.10, "t").unwrap();
        record_fill(&sd, "QQQ260320C00600000", 1, Side::Sell, 4.30, "t").unwrap();
        record_fill(&sd, "QQQ260320C00610000", 2, Side::Sell, 2.20, "t").unwrap();

        let book = load_book(&sd).unwrap();
        assert_eq!(book.get("QQQ260320C00600000"), Some(&2));
        assert_eq!(book.get("QQQ260320C00610000"), Some(&-2));
    }

    #[test]
    fn flat_symbols_are_pruned() {
        let (_td, sd) = dir();
        record_fill(&sd, "SPY270115P00412500", 5, Side::Buy, 1.0, "t").unwrap();
        record_fill(&sd, "SPY270115P00412500", 5, Side::Sell, 1.2, "t").unwrap();
        let book = load_book(&sd).unwrap();
        assert!(book.is_empty());
    }

    #[test]
    fn unknown_side_lines_are_ignored() {
        let (_td, sd) = dir();
        record_fill(&sd, "A260320C00100000", 1, Side::Buy, 1.0, "t").unwrap();
        // A line with a side this build does not know about.
        std::fs::OpenOptions::new()
            .append(true)
            .open(sd.path(POSITIONS_LOG))
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(
                    f,
                    r#"{{"ts":"2026-03-20T12:00:00Z","type":"FILL","symbol":"A260320C00100000","qty":9,"side":"SHORT_EXEMPT","price":1.0,"tag":"x"}}"#
                )
            })
            .unwrap();
        let book = load_book(&sd).unwrap();
        assert_eq!(book.get("A260320C00100000"), Some(&1));
    }

    #[test]
    fn rebuild_is_deterministic_and_idempotent() {
        let (_td, sd) = dir();
        record_fill(&sd, "QQQ260320C00600000", 2, Side::Buy, 4.0, "t").unwrap();
        record_fill(&sd, "SPY270115P00412500", 1, Side::Sell, 2.0, "t").unwrap();

        let a = rebuild_positions_book(&sd).unwrap();
        let b = rebuild_positions_book(&sd).unwrap();
        assert_eq!(a.positions, b.positions);
        // Sorted by symbol.
        assert_eq!(a.positions[0].symbol, "QQQ260320C00600000");
        assert_eq!(a.positions[1].symbol, "SPY270115P00412500");
    }
}
