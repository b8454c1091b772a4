//! Broker adapter seam.
//!
//! The core consumes brokers through [`BrokerApi`]; the only implementation
//! in-tree is the deterministic [`PaperBroker`]. Execution-mode dispatch is a
//! two-variant [`BrokerMode`]: PLAN_ONLY resolves and stops, LIVE submits,
//! but only behind two explicit operator acknowledgments (the allow flag and
//! a limit price). There is no code path that submits without both.

mod paper;
mod submit;

pub use paper::PaperBroker;
pub use submit::{open_signature, Broker, BrokerMode, LiveConfig, OpenRequest, SubmitOutcome};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A vertical to resolve against the option chain.
#[derive(Debug, Clone, PartialEq)]
pub struct VerticalSpec {
    pub underlier: String,
    pub is_call: bool,
    pub k_long: f64,
    pub k_short: f64,
    pub dte_days: i64,
}

/// Exact leg symbols for a resolved vertical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVertical {
    pub long_symbol: String,
    pub short_symbol: String,
    pub expiration: NaiveDate,
    pub dte_days: i64,
}

/// Direction of one order leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// One leg of a multi-leg order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub symbol: String,
    pub ratio_qty: i64,
    pub side: OrderSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Day,
}

/// Broker's view of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub raw: Value,
}

/// Broker-side failures, tagged for journaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    NoContractsFound,
    NoExpirationInWindow,
    LegSymbolNotFound { expiration: NaiveDate },
    UnknownOrder { id: String },
    InvalidOrder { detail: String },
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::NoContractsFound => write!(f, "NO_CONTRACTS_FOUND"),
            BrokerError::NoExpirationInWindow => write!(f, "NO_EXPIRATION_IN_WINDOW"),
            BrokerError::LegSymbolNotFound { expiration } => {
                write!(f, "LEG_SYMBOL_NOT_FOUND exp={expiration}")
            }
            BrokerError::UnknownOrder { id } => write!(f, "UNKNOWN_ORDER {id}"),
            BrokerError::InvalidOrder { detail } => write!(f, "INVALID_ORDER {detail}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// The contract every broker backend satisfies.
pub trait BrokerApi {
    /// Pick the expiration nearest `today + dte_days` within ±10 days whose
    /// chain holds exact strike matches (tolerance 1e-6) for both legs.
    fn resolve_vertical(&self, spec: &VerticalSpec) -> Result<ResolvedVertical, BrokerError>;

    /// Submit one multi-leg limit order.
    fn submit_multileg_limit(
        &self,
        legs: &[OrderLeg],
        qty: i64,
        limit_price: f64,
        tif: TimeInForce,
    ) -> Result<OrderSnapshot, BrokerError>;

    fn get_order(&self, id: &str) -> Result<OrderSnapshot, BrokerError>;

    fn list_open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError>;
}
