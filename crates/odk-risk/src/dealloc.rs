//! Deallocation sizing: how many spreads of a candidate vertical fit under
//! the portfolio limits, given the portfolio's current totals.
//!
//! The incremental greeks of one spread are inferred from the two leg rows
//! already present in the greeks snapshot (position-weighted rows divided by
//! their net quantities). Binary search finds the largest quantity whose
//! projected totals stay inside the limits on every axis.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use odk_portfolio::{GreeksSnapshot, GreeksTotals};
use odk_state::{utc_now, RiskMode, RiskModeStore, StateDir, DEALLOC_PLAN, PORTFOLIO_GREEKS};

use crate::policy::RiskLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeallocStatus {
    Ok,
    CannotDealloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeallocAction {
    SetQtyToAllowed,
    NoChange,
}

/// The `dealloc_plan.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeallocPlan {
    pub ts: DateTime<Utc>,
    pub status: DeallocStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_qty: i64,
    pub allowed_qty: i64,
    pub limits: RiskLimits,
    pub base_totals: GreeksTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inc_per_spread: Option<GreeksTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<DeallocAction>,
}

fn fits(base: &GreeksTotals, inc: &GreeksTotals, lim: &RiskLimits, q: i64) -> bool {
    let qf = q as f64;
    (base.delta + qf * inc.delta).abs() <= lim.max_abs_delta
        && (base.gamma + qf * inc.gamma).abs() <= lim.max_abs_gamma
        && (base.vega + qf * inc.vega).abs() <= lim.max_abs_vega
}

/// Largest `q` in `[0, qty_max]` such that `|base + q·inc|` stays inside the
/// limits on delta, gamma, and vega simultaneously.
pub fn max_qty_with_limits(
    base: &GreeksTotals,
    inc: &GreeksTotals,
    lim: &RiskLimits,
    qty_max: i64,
) -> i64 {
    let (mut lo, mut hi) = (0i64, qty_max.max(0));
    let mut best = 0i64;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        if fits(base, inc, lim, mid) {
            best = mid;
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    best
}

/// Size a resolved vertical against the current portfolio and publish the
/// resulting risk-mode downgrade: DEGRADED when some quantity is allowed,
/// HALT when none is.
pub fn run_dealloc(
    dir: &StateDir,
    long_symbol: &str,
    short_symbol: &str,
    requested_qty: i64,
    lim: &RiskLimits,
) -> Result<DeallocPlan> {
    let snap: Option<GreeksSnapshot> = dir.read_json(PORTFOLIO_GREEKS)?;
    let Some(snap) = snap else {
        let plan = DeallocPlan {
            ts: utc_now(),
            status: DeallocStatus::CannotDealloc,
            reason: Some("NO_GREEKS_SNAPSHOT".to_string()),
            requested_qty,
            allowed_qty: 0,
            limits: *lim,
            base_totals: GreeksTotals::default(),
            inc_per_spread: None,
            action: None,
        };
        dir.write_json_atomic(DEALLOC_PLAN, &plan)?;
        return Ok(plan);
    };

    // Per-contract greeks for each leg; a flat row cannot be normalized and
    // the whole sizing is refused.
    let per_contract = |sym: &str| -> Option<GreeksTotals> {
        let row = snap.positions.iter().find(|p| p.symbol == sym)?;
        if row.net_qty == 0 {
            return None;
        }
        let nq = row.net_qty as f64;
        Some(GreeksTotals {
            delta: row.delta / nq,
            gamma: row.gamma / nq,
            vega: row.vega / nq,
            theta: row.theta / nq,
        })
    };

    let (Some(long_pc), Some(short_pc)) = (per_contract(long_symbol), per_contract(short_symbol))
    else {
        let plan = DeallocPlan {
            ts: utc_now(),
            status: DeallocStatus::CannotDealloc,
            reason: Some("MISSING_LEG_GREEKS".to_string()),
            requested_qty,
            allowed_qty: 0,
            limits: *lim,
            base_totals: snap.totals,
            inc_per_spread: None,
            action: None,
        };
        dir.write_json_atomic(DEALLOC_PLAN, &plan)?;
        return Ok(plan);
    };

    let inc = GreeksTotals {
        delta: long_pc.delta + short_pc.delta,
        gamma: long_pc.gamma + short_pc.gamma,
        vega: long_pc.vega + short_pc.vega,
        theta: long_pc.theta + short_pc.theta,
    };

    let allowed = max_qty_with_limits(&snap.totals, &inc, lim, requested_qty);

    let plan = DeallocPlan {
        ts: utc_now(),
        status: DeallocStatus::Ok,
        reason: None,
        requested_qty,
        allowed_qty: allowed,
        limits: *lim,
        base_totals: snap.totals,
        inc_per_spread: Some(inc),
        action: Some(if allowed < requested_qty {
            DeallocAction::SetQtyToAllowed
        } else {
            DeallocAction::NoChange
        }),
    };
    dir.write_json_atomic(DEALLOC_PLAN, &plan)?;

    let store = RiskModeStore::new(dir);
    if allowed > 0 {
        store.set(RiskMode::Degraded, format!("DEALLOC_ALLOWED_QTY={allowed}"))?;
    } else {
        store.set(RiskMode::Halt, "DEALLOC_ZERO_ALLOWED")?;
    }

    Ok(plan)
}
