//! CLOSE executor: reduce-only consumption of `close_intent.json`.
//!
//! Validation is all-or-nothing: one bad action rejects the whole batch.
//! Reduce-only table:
//!
//! | net position | permitted                  |
//! |--------------|----------------------------|
//! | net > 0      | SELL with qty ≤ net        |
//! | net < 0      | BUY with qty ≤ \|net\|     |
//! | net = 0      | nothing                    |
//!
//! A stale intent is rejected but retained on disk for audit; only a
//! successfully executed (or empty) intent is deleted.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use odk_journal::Journal;
use odk_portfolio::{record_fill, GreeksSnapshot, PositionRow, PositionsBook, Side};
use odk_risk::{CloseAction, CloseIntent};
use odk_state::{
    utc_now, RiskMode, RiskModeStore, StateDir, CLOSE_INTENT, OMS_CLOSE_LOCK, OMS_CLOSE_STATE,
    PORTFOLIO_GREEKS, POSITIONS_BOOK,
};

pub const DEFAULT_INTENT_MAX_AGE_SEC: i64 = 300;

#[derive(Debug, Clone, Copy)]
pub struct CloseConfig {
    /// Maximum intent age before it is rejected as stale.
    pub max_age_sec: i64,
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            max_age_sec: DEFAULT_INTENT_MAX_AGE_SEC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseState {
    Locked,
    Halt,
    NoIntent,
    Reject,
    Done,
}

/// One simulated close fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseStep {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    #[serde(default)]
    pub price_proxy: Option<f64>,
    pub result: String,
}

/// The `oms_close_state.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmsCloseState {
    pub ts: DateTime<Utc>,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_mode: Option<RiskMode>,
    pub state: CloseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaches: Vec<String>,
    #[serde(default)]
    pub steps: Vec<CloseStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_age_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions_before: Option<Vec<PositionRow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions_after: Option<Vec<PositionRow>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<CloseAction>,
}

impl OmsCloseState {
    fn bare(mode: &str, state: CloseState, reason: Option<String>) -> Self {
        Self {
            ts: utc_now(),
            mode: mode.to_string(),
            risk_mode: None,
            state,
            reason,
            breaches: Vec::new(),
            steps: Vec::new(),
            intent_ts: None,
            intent_age_sec: None,
            positions_before: None,
            positions_after: None,
            actions: Vec::new(),
        }
    }
}

/// Aggregate actions on `(symbol, side)`, drop empty or unknown-side rows,
/// and sort for deterministic execution order.
pub fn normalize_actions(actions: &[CloseAction]) -> Vec<CloseAction> {
    let mut agg: BTreeMap<(String, Side), i64> = BTreeMap::new();
    for a in actions {
        let symbol = a.symbol.trim();
        if symbol.is_empty() || a.qty <= 0 || !matches!(a.close_side, Side::Buy | Side::Sell) {
            continue;
        }
        *agg.entry((symbol.to_string(), a.close_side)).or_insert(0) += a.qty;
    }
    agg.into_iter()
        .map(|((symbol, close_side), qty)| CloseAction {
            symbol,
            close_side,
            qty,
        })
        .collect()
}

/// Check every action against the reduce-only table. Returns one breach
/// string per violation; empty means the batch is sound.
pub fn validate_reduce_only(actions: &[CloseAction], positions: &BTreeMap<String, i64>) -> Vec<String> {
    let mut breaches = Vec::new();
    for a in actions {
        let net = positions.get(&a.symbol).copied().unwrap_or(0);

        if net == 0 {
            breaches.push(format!(
                "REDUCE_ONLY_VIOLATION {} net=0 action={} qty={}",
                a.symbol, a.close_side, a.qty
            ));
            continue;
        }

        if net > 0 {
            if a.close_side != Side::Sell {
                breaches.push(format!(
                    "REDUCE_ONLY_VIOLATION {} net={} requires SELL got {}",
                    a.symbol, net, a.close_side
                ));
            }
            if a.qty > net {
                breaches.push(format!(
                    "REDUCE_ONLY_VIOLATION {} qty {} > net {}",
                    a.symbol, a.qty, net
                ));
            }
        } else {
            if a.close_side != Side::Buy {
                breaches.push(format!(
                    "REDUCE_ONLY_VIOLATION {} net={} requires BUY got {}",
                    a.symbol, net, a.close_side
                ));
            }
            if a.qty > net.abs() {
                breaches.push(format!(
                    "REDUCE_ONLY_VIOLATION {} qty {} > abs(net) {}",
                    a.symbol, a.qty, net.abs()
                ));
            }
        }
    }
    breaches
}

fn apply_close(positions: &mut BTreeMap<String, i64>, symbol: &str, side: Side, qty: i64) {
    let net = positions.get(symbol).copied().unwrap_or(0);
    let next = match side {
        Side::Sell => net - qty,
        Side::Buy => net + qty,
        Side::Unknown => net,
    };
    if next == 0 {
        positions.remove(symbol);
    } else {
        positions.insert(symbol.to_string(), next);
    }
}

/// Plan-only fill price: the position's last-known mid from the greeks
/// snapshot, when one exists.
fn price_proxy(greeks: Option<&GreeksSnapshot>, symbol: &str) -> Option<f64> {
    greeks?
        .positions
        .iter()
        .find(|p| p.symbol == symbol)
        .map(|p| p.mid)
        .filter(|m| *m > 0.0)
}

/// Run the CLOSE executor once.
pub fn run_close(dir: &StateDir, journal: &Journal<'_>, cfg: &CloseConfig) -> Result<OmsCloseState> {
    let mode = "PLAN_ONLY";

    let Some(_lock) = dir.try_lock(OMS_CLOSE_LOCK)? else {
        let state = OmsCloseState::bare(
            mode,
            CloseState::Locked,
            Some("ANOTHER_OMS_CLOSE_RUNNING".to_string()),
        );
        dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
        return Ok(state);
    };

    let rm = RiskModeStore::new(dir).load_or_boot()?;

    if !rm.mode.allow_close() {
        let mut state = OmsCloseState::bare(
            mode,
            CloseState::Halt,
            Some(format!("RISK_MODE_BLOCKS_CLOSE:{}", rm.reason)),
        );
        state.risk_mode = Some(rm.mode);
        dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
        tracing::warn!(mode = %rm.mode, "close blocked by risk mode");
        return Ok(state);
    }

    let Some(intent) = dir.read_json::<CloseIntent>(CLOSE_INTENT)? else {
        let mut state =
            OmsCloseState::bare(mode, CloseState::NoIntent, Some("NO_CLOSE_INTENT".to_string()));
        state.risk_mode = Some(rm.mode);
        dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
        return Ok(state);
    };

    let intent_ts_str = intent.ts.to_rfc3339();
    let age_sec = (utc_now() - intent.ts).num_seconds().max(0);
    if age_sec > cfg.max_age_sec {
        let reason = format!("STALE_INTENT age_sec={} > max_age={}", age_sec, cfg.max_age_sec);
        journal.record(&intent.kind, &intent_ts_str, "CLOSE_EXEC", false, mode, &reason, json!({}));
        let mut state = OmsCloseState::bare(mode, CloseState::Reject, Some(reason));
        state.risk_mode = Some(rm.mode);
        state.intent_ts = Some(intent.ts);
        state.intent_age_sec = Some(age_sec);
        // Intent retained for audit.
        dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
        return Ok(state);
    }

    let actions = normalize_actions(&intent.actions);
    if actions.is_empty() {
        // Delete the empty intent so the pipeline cannot loop on it.
        dir.delete(CLOSE_INTENT)?;
        let mut state = OmsCloseState::bare(
            mode,
            CloseState::Done,
            Some("NO_ACTIONS_IN_INTENT".to_string()),
        );
        state.risk_mode = Some(rm.mode);
        state.intent_ts = Some(intent.ts);
        dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
        return Ok(state);
    }

    let book: PositionsBook = dir
        .read_json(POSITIONS_BOOK)?
        .unwrap_or_else(|| PositionsBook {
            ts: utc_now(),
            positions: Vec::new(),
        });
    let mut positions = book.to_map();
    let positions_before = PositionsBook::from_map(utc_now(), &positions).positions;

    let breaches = validate_reduce_only(&actions, &positions);
    if !breaches.is_empty() {
        journal.record(
            &intent.kind,
            &intent_ts_str,
            "CLOSE_EXEC",
            false,
            mode,
            "REDUCE_ONLY_VIOLATION",
            json!({"breaches": &breaches}),
        );
        let mut state = OmsCloseState::bare(
            mode,
            CloseState::Reject,
            Some("REDUCE_ONLY_VIOLATION".to_string()),
        );
        state.risk_mode = Some(rm.mode);
        state.breaches = breaches;
        state.intent_ts = Some(intent.ts);
        state.intent_age_sec = Some(age_sec);
        state.positions_before = Some(positions_before);
        state.actions = actions;
        dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
        return Ok(state);
    }

    // Simulated fills: ledger first (append-only truth), then the book.
    let greeks: Option<GreeksSnapshot> = dir.read_json(PORTFOLIO_GREEKS)?;
    let mut steps = Vec::with_capacity(actions.len());
    for a in &actions {
        let px = price_proxy(greeks.as_ref(), &a.symbol);
        record_fill(
            dir,
            &a.symbol,
            a.qty,
            a.close_side,
            px.unwrap_or(0.0),
            "DERISK_CLOSE_FILL_SIM",
        )?;
        apply_close(&mut positions, &a.symbol, a.close_side, a.qty);
        steps.push(CloseStep {
            ts: utc_now(),
            symbol: a.symbol.clone(),
            side: a.close_side,
            qty: a.qty,
            price_proxy: px,
            result: "SIM_FILLED".to_string(),
        });
    }

    let new_book = PositionsBook::from_map(utc_now(), &positions);
    dir.write_json_atomic(POSITIONS_BOOK, &new_book)?;

    journal.record(
        &intent.kind,
        &intent_ts_str,
        "CLOSE_EXEC",
        true,
        mode,
        "",
        json!({"steps": steps.len()}),
    );
    dir.delete(CLOSE_INTENT)?;

    let mut state = OmsCloseState::bare(mode, CloseState::Done, None);
    state.risk_mode = Some(rm.mode);
    state.steps = steps;
    state.intent_ts = Some(intent.ts);
    state.intent_age_sec = Some(age_sec);
    state.positions_before = Some(positions_before);
    state.positions_after = Some(new_book.positions);
    state.actions = actions;
    dir.write_json_atomic(OMS_CLOSE_STATE, &state)?;
    tracing::info!(steps = state.steps.len(), "close batch executed");
    Ok(state)
}
