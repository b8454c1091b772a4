use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trade direction on a fill or close action.
///
/// Anything unrecognized deserializes to `Unknown` and is ignored by the
/// book fold (forward compatibility with richer upstream feeds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
    #[serde(other)]
    Unknown,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger line discriminator. Only `FILL` lines participate in the book fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEventKind {
    Fill,
    #[serde(other)]
    Other,
}

/// One executed (or simulated) fill. Append-only; never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LedgerEventKind,
    pub symbol: String,
    pub qty: i64,
    pub side: Side,
    pub price: f64,
    pub tag: String,
}

/// One net position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRow {
    pub symbol: String,
    pub net_qty: i64,
}

/// Materialized net positions, sorted by symbol, flat entries pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsBook {
    pub ts: DateTime<Utc>,
    pub positions: Vec<PositionRow>,
}

impl PositionsBook {
    pub fn to_map(&self) -> BTreeMap<String, i64> {
        self.positions
            .iter()
            .map(|p| (p.symbol.clone(), p.net_qty))
            .collect()
    }

    pub fn from_map(ts: DateTime<Utc>, map: &BTreeMap<String, i64>) -> Self {
        Self {
            ts,
            positions: map
                .iter()
                .filter(|(_, q)| **q != 0)
                .map(|(s, q)| PositionRow {
                    symbol: s.clone(),
                    net_qty: *q,
                })
                .collect(),
        }
    }
}

/// Per-underlier market context written by the external MD ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnderlierQuote {
    #[serde(default)]
    pub spot: Option<f64>,
    #[serde(default)]
    pub spot_src: Option<String>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub quote_spread_pct: Option<f64>,
    #[serde(default)]
    pub chain_contracts: Option<i64>,
}

/// The `market_state.json` snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketState {
    #[serde(default)]
    pub symbols: BTreeMap<String, UnderlierQuote>,
}

/// Provenance of a per-position implied volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IvSource {
    Newton,
    Bisect,
    FallbackDefault,
}

/// One position's greeks, position-weighted (per-contract × net_qty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionGreeksRow {
    pub symbol: String,
    pub underlier: String,
    pub exp: NaiveDate,
    pub is_call: bool,
    pub strike: f64,
    pub spot: Option<f64>,
    pub spot_src: Option<String>,
    pub net_qty: i64,
    /// Last-known per-share option mid used as the IV target.
    pub mid: f64,
    pub spr_pct: f64,
    pub iv: f64,
    pub iv_src: IvSource,
    pub delta: f64,
    pub gamma: f64,
    /// Dollars per 1.00 vol, position-weighted.
    pub vega: f64,
    /// Dollars per year, position-weighted.
    pub theta: f64,
}

/// Portfolio-wide sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GreeksTotals {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

/// The `portfolio_greeks.json` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksSnapshot {
    pub ts: DateTime<Utc>,
    pub positions: Vec<PositionGreeksRow>,
    pub totals: GreeksTotals,
}
