//! Mode-dispatched OPEN submission.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{BrokerApi, OrderLeg, OrderSide, ResolvedVertical, TimeInForce, VerticalSpec};

/// Execution mode. LIVE carries its own guard state so a `Live` value with
/// missing acknowledgments is representable (and refused at submit time with
/// the exact operator hint).
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMode {
    PlanOnly,
    Live(LiveConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveConfig {
    /// `ALLOW_LIVE_ORDERS=1` acknowledgment.
    pub allow_live_orders: bool,
    /// `LIVE_LIMIT_PRICE` acknowledgment.
    pub limit_price: Option<f64>,
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::PlanOnly => "PLAN_ONLY",
            BrokerMode::Live(_) => "LIVE",
        }
    }
}

impl std::fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the OPEN executor asks the broker layer to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub underlier: String,
    pub is_call: bool,
    #[serde(rename = "K_long")]
    pub k_long: f64,
    #[serde(rename = "K_short")]
    pub k_short: f64,
    pub dte_days: i64,
    pub qty: i64,
    pub tag: String,
}

/// Outcome of one `submit_open` call. `ok` means the mode's contract was
/// satisfied (a PLAN_ONLY translate counts); `submitted` means a real order
/// reached the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub ok: bool,
    pub mode: String,
    pub submitted: bool,
    #[serde(default)]
    pub resolved: Option<ResolvedVertical>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Dedup signature for idempotent OPEN retries.
pub fn open_signature(req: &OpenRequest, expiration: NaiveDate) -> String {
    let side = if req.is_call { "C" } else { "P" };
    let raw = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        req.underlier,
        expiration.format("%Y%m%d"),
        side,
        req.k_long,
        req.k_short,
        req.qty,
        req.tag
    );
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// A broker backend behind the execution-mode gate.
pub struct Broker<B: BrokerApi> {
    mode: BrokerMode,
    api: B,
}

impl<B: BrokerApi> Broker<B> {
    pub fn new(mode: BrokerMode, api: B) -> Self {
        Self { mode, api }
    }

    pub fn mode(&self) -> &BrokerMode {
        &self.mode
    }

    pub fn api(&self) -> &B {
        &self.api
    }

    /// Resolve, and in LIVE (with both guards present) submit one multi-leg
    /// DAY limit order: long leg BUY ratio 1, short leg SELL ratio 1.
    ///
    /// Failures are carried as tagged strings in the outcome rather than
    /// errors; the executor journals them and the tick continues.
    pub fn submit_open(&self, req: &OpenRequest) -> SubmitOutcome {
        let mode = self.mode.as_str().to_string();

        let spec = VerticalSpec {
            underlier: req.underlier.clone(),
            is_call: req.is_call,
            k_long: req.k_long,
            k_short: req.k_short,
            dte_days: req.dte_days,
        };

        let resolved = match self.api.resolve_vertical(&spec) {
            Ok(r) => r,
            Err(e) => {
                return SubmitOutcome {
                    ok: false,
                    mode,
                    submitted: false,
                    resolved: None,
                    order_id: None,
                    signature: None,
                    error: Some(format!("RESOLVE_FAILED:{e}")),
                };
            }
        };
        let signature = open_signature(req, resolved.expiration);

        let live = match &self.mode {
            BrokerMode::PlanOnly => {
                return SubmitOutcome {
                    ok: true,
                    mode,
                    submitted: false,
                    resolved: Some(resolved),
                    order_id: None,
                    signature: Some(signature),
                    error: None,
                };
            }
            BrokerMode::Live(cfg) => cfg,
        };

        if !live.allow_live_orders {
            return SubmitOutcome {
                ok: false,
                mode,
                submitted: false,
                resolved: Some(resolved),
                order_id: None,
                signature: Some(signature),
                error: Some("LIVE_BLOCKED_SET_ALLOW_LIVE_ORDERS=1".to_string()),
            };
        }
        let Some(limit_price) = live.limit_price else {
            return SubmitOutcome {
                ok: false,
                mode,
                submitted: false,
                resolved: Some(resolved),
                order_id: None,
                signature: Some(signature),
                error: Some("LIVE_NEEDS_LIMIT_PRICE_SET_LIVE_LIMIT_PRICE".to_string()),
            };
        };

        let legs = [
            OrderLeg {
                symbol: resolved.long_symbol.clone(),
                ratio_qty: 1,
                side: OrderSide::Buy,
            },
            OrderLeg {
                symbol: resolved.short_symbol.clone(),
                ratio_qty: 1,
                side: OrderSide::Sell,
            },
        ];

        match self
            .api
            .submit_multileg_limit(&legs, req.qty, limit_price, TimeInForce::Day)
        {
            Ok(order) => {
                tracing::info!(order_id = %order.id, qty = req.qty, "live order submitted");
                SubmitOutcome {
                    ok: true,
                    mode,
                    submitted: true,
                    resolved: Some(resolved),
                    order_id: Some(order.id),
                    signature: Some(signature),
                    error: None,
                }
            }
            Err(e) => SubmitOutcome {
                ok: false,
                mode,
                submitted: false,
                resolved: Some(resolved),
                order_id: None,
                signature: Some(signature),
                error: Some(format!("BROKER_SUBMIT_FAILED:{e}")),
            },
        }
    }
}
