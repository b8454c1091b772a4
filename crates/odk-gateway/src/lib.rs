//! Pre-trade gateway: liquidity gate plus per-trade worst-case sizing.
//!
//! Order of checks matters: the underlier quote is validated before any risk
//! work, so a dead feed rejects cheaply. Sizing prices ONE spread under two
//! stress scenarios (gap −10%, and −7% with vols up 10 points) and divides
//! the account's defined-risk budget by the worst loss.
//!
//! The decision path never errors out of the stage: anything that would be a
//! failure becomes an `allow = false` candidate with a tagged reason, and
//! the tick carries on.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use odk_math::{incremental_worst_losses, Leg};
use odk_portfolio::MarketState;
use odk_state::{utc_now, StateDir, GATE_OUT, MARKET_STATE};

pub const DEFAULT_MAX_UNDERLIER_SPREAD_PCT: f64 = 1.0;

/// A strategy-layer request to open a vertical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerticalIntent {
    pub underlier: String,
    pub is_call: bool,
    #[serde(rename = "K_long")]
    pub k_long: f64,
    #[serde(rename = "K_short")]
    pub k_short: f64,
    pub dte_days: i64,
    pub qty_requested: i64,
    pub r: f64,
    pub iv_long: f64,
    pub iv_short: f64,
    pub tag: String,
}

/// Gateway sizing parameters; environment overrides resolve to this at the
/// process edge.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub equity_usd: f64,
    pub max_defined_risk_pct: f64,
    pub max_underlier_spread_pct: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            equity_usd: 100_000.0,
            max_defined_risk_pct: 0.02,
            max_underlier_spread_pct: DEFAULT_MAX_UNDERLIER_SPREAD_PCT,
        }
    }
}

/// Underlier context distilled from `market_state.json`.
#[derive(Debug, Clone, Default)]
pub struct UnderlierCtx {
    pub spot: Option<f64>,
    pub spot_src: Option<String>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub quote_spread_pct: Option<f64>,
}

/// The sizing verdict for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub allow: bool,
    pub max_contracts: i64,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub worst_pnl_gap10: Option<f64>,
    #[serde(default)]
    pub worst_pnl_combo: Option<f64>,
}

impl GateDecision {
    fn reject(reasons: Vec<String>) -> Self {
        Self {
            allow: false,
            max_contracts: 0,
            reasons,
            worst_pnl_gap10: None,
            worst_pnl_combo: None,
        }
    }
}

/// The executable plan attached to an allowed candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlan {
    #[serde(rename = "type")]
    pub kind: String,
    pub underlier: String,
    pub is_call: bool,
    #[serde(rename = "K_long")]
    pub k_long: f64,
    #[serde(rename = "K_short")]
    pub k_short: f64,
    pub dte_days: i64,
    pub qty: i64,
    pub limit_logic: String,
    pub tag: String,
    #[serde(default)]
    pub spot_used: Option<f64>,
    #[serde(default)]
    pub spot_src: Option<String>,
}

/// One gated candidate: either a plan or a reasoned refusal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCandidate {
    pub allow: bool,
    #[serde(default)]
    pub order_plan: Option<OrderPlan>,
    pub decision: GateDecision,
}

/// The `gate_out.json` record: every candidate evaluated this tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOut {
    pub ts: DateTime<Utc>,
    pub out: BTreeMap<String, GateCandidate>,
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

/// Pull one underlier's context out of the market snapshot, recomputing the
/// quote spread from bid/ask rather than trusting the reported field.
pub fn read_underlier_ctx(market: &MarketState, underlier: &str) -> UnderlierCtx {
    let Some(q) = market.symbols.get(underlier) else {
        return UnderlierCtx::default();
    };

    let bid = q.bid.and_then(finite);
    let ask = q.ask.and_then(finite);
    let spread_pct = match (bid, ask) {
        (Some(b), Some(a)) if b > 0.0 && a > 0.0 && a >= b => {
            let mid = 0.5 * (a + b);
            (mid > 0.0).then(|| (a - b) / mid * 100.0)
        }
        _ => None,
    };

    UnderlierCtx {
        spot: q.spot.and_then(finite),
        spot_src: q.spot_src.clone(),
        bid,
        ask,
        quote_spread_pct: spread_pct,
    }
}

/// Liquidity sanity on the underlier quote. Empty result means tradable.
pub fn validate_underlier_liquidity(ctx: &UnderlierCtx, max_spread_pct: f64) -> Vec<String> {
    let mut reasons = Vec::new();
    match (ctx.bid, ctx.ask) {
        (None, _) | (_, None) => reasons.push("NO_UNDERLIER_QUOTE".to_string()),
        (Some(bid), Some(ask)) if bid <= 0.0 || ask <= 0.0 || ask < bid => {
            reasons.push("BAD_UNDERLIER_QUOTE".to_string());
        }
        _ => {
            if let Some(spr) = ctx.quote_spread_pct {
                if spr > max_spread_pct {
                    reasons.push("WIDE_UNDERLIER_QUOTE_SPREAD".to_string());
                }
            }
        }
    }
    reasons
}

/// Worst-case sizing for one intent against a known spot.
fn decide_vertical(intent: &VerticalIntent, spot: f64, cfg: &GateConfig) -> GateDecision {
    let t = (intent.dte_days as f64 / 365.0).max(1e-6);
    let legs = [
        Leg {
            k: intent.k_long,
            is_call: intent.is_call,
            qty: 1,
            side: 1,
            iv: intent.iv_long,
        },
        Leg {
            k: intent.k_short,
            is_call: intent.is_call,
            qty: 1,
            side: -1,
            iv: intent.iv_short,
        },
    ];

    let (worst_gap, worst_combo) = incremental_worst_losses(spot, intent.r, t, &legs);
    if !worst_gap.is_finite() || !worst_combo.is_finite() {
        return GateDecision::reject(vec!["RISK_GOVERNOR_ERROR:NON_FINITE_PNL".to_string()]);
    }

    let worst_1 = worst_gap.min(worst_combo);
    let loss_mag = (-worst_1).max(0.0);

    if loss_mag <= 0.0 {
        // Structure cannot lose under either stress; the request passes
        // through unchanged.
        return GateDecision {
            allow: true,
            max_contracts: intent.qty_requested,
            reasons: Vec::new(),
            worst_pnl_gap10: Some(worst_gap),
            worst_pnl_combo: Some(worst_combo),
        };
    }

    let budget = cfg.equity_usd * cfg.max_defined_risk_pct;
    let max_contracts = (budget / loss_mag).floor() as i64;

    if max_contracts <= 0 {
        return GateDecision {
            allow: false,
            max_contracts: 0,
            reasons: vec!["SIZING_TO_ZERO_BY_LIMITS".to_string()],
            worst_pnl_gap10: Some(worst_gap),
            worst_pnl_combo: Some(worst_combo),
        };
    }

    GateDecision {
        allow: true,
        max_contracts: max_contracts.min(intent.qty_requested),
        reasons: Vec::new(),
        worst_pnl_gap10: Some(worst_gap),
        worst_pnl_combo: Some(worst_combo),
    }
}

/// Evaluate one intent: liquidity first, then sizing.
pub fn build_vertical_candidate(
    market: &MarketState,
    intent: &VerticalIntent,
    cfg: &GateConfig,
) -> GateCandidate {
    let ctx = read_underlier_ctx(market, &intent.underlier);

    let liq_reasons = validate_underlier_liquidity(&ctx, cfg.max_underlier_spread_pct);
    if !liq_reasons.is_empty() {
        return GateCandidate {
            allow: false,
            order_plan: None,
            decision: GateDecision::reject(liq_reasons),
        };
    }

    // Liquidity passed, so bid/ask are sane; prefer the reported spot, fall
    // back to the quote mid.
    let spot = ctx
        .spot
        .or_else(|| match (ctx.bid, ctx.ask) {
            (Some(b), Some(a)) => Some(0.5 * (a + b)),
            _ => None,
        })
        .unwrap_or(0.0);

    let decision = decide_vertical(intent, spot, cfg);
    if !decision.allow {
        return GateCandidate {
            allow: false,
            order_plan: None,
            decision,
        };
    }

    let qty_final = intent.qty_requested.min(decision.max_contracts);
    GateCandidate {
        allow: true,
        order_plan: Some(OrderPlan {
            kind: "VERTICAL".to_string(),
            underlier: intent.underlier.clone(),
            is_call: intent.is_call,
            k_long: intent.k_long,
            k_short: intent.k_short,
            dte_days: intent.dte_days,
            qty: qty_final,
            limit_logic: "MID_THEN_STEP".to_string(),
            tag: intent.tag.clone(),
            spot_used: ctx.spot,
            spot_src: ctx.spot_src,
        }),
        decision,
    }
}

/// Gate every named intent and atomically write `gate_out.json`.
pub fn run_gateway(
    dir: &StateDir,
    intents: &[(String, VerticalIntent)],
    cfg: &GateConfig,
) -> Result<GateOut> {
    let market: MarketState = dir.read_json(MARKET_STATE)?.unwrap_or_default();

    let mut out = BTreeMap::new();
    for (name, intent) in intents {
        let cand = build_vertical_candidate(&market, intent, cfg);
        tracing::info!(
            candidate = %name,
            allow = cand.allow,
            max_contracts = cand.decision.max_contracts,
            "gate decision"
        );
        out.insert(name.clone(), cand);
    }

    let payload = GateOut { ts: utc_now(), out };
    dir.write_json_atomic(GATE_OUT, &payload)?;
    Ok(payload)
}
