//! Order poller: track broker statuses to terminal, alerting on change.
//!
//! Statuses are normalized to lowercase tokens (any `orderstatus.`-style
//! enum prefix stripped) before comparison, so SDK-shaped strings and plain
//! tokens converge. Terminal orders are pruned from the store after their
//! final transition is recorded.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use odk_broker::BrokerApi;
use odk_journal::Journal;
use odk_state::{utc_now, StateDir, OMS_POLL_STATE};

use crate::store::{load_open_orders, save_open_orders};

const TERMINAL: [&str; 5] = ["filled", "canceled", "rejected", "expired", "failed"];

/// Alert severity for external notification glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Yellow,
    Orange,
    Red,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Yellow => "YELLOW",
            Severity::Orange => "ORANGE",
            Severity::Red => "RED",
        }
    }
}

/// Normalize a broker status to a stable lowercase token, stripping any
/// dotted enum prefix (`OrderStatus.ACCEPTED` → `accepted`).
pub fn norm_status(s: &str) -> String {
    let txt = s.trim();
    let txt = txt.rsplit('.').next().unwrap_or(txt);
    let t = txt.to_ascii_lowercase();
    if t.is_empty() {
        "unknown".to_string()
    } else {
        t
    }
}

pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL.contains(&status)
}

/// Severity of a normalized status; `None` for statuses nobody alerts on.
pub fn severity_for(status: &str) -> Option<Severity> {
    match status {
        "new" | "pending_new" | "accepted" => Some(Severity::Yellow),
        "partially_filled" | "replaced" => Some(Severity::Orange),
        s if is_terminal_status(s) => Some(Severity::Red),
        _ => None,
    }
}

/// One observed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollChange {
    pub order_id: String,
    pub prev: String,
    pub new: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollOutcome {
    NoOrders,
    PollOk,
    PollPartial,
}

/// The `oms_poll_state.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollState {
    pub ts: DateTime<Utc>,
    pub mode: String,
    pub ok: bool,
    pub state: PollOutcome,
    pub n_orders: usize,
    pub changed: Vec<PollChange>,
    pub pruned: Vec<String>,
    pub errors: Vec<String>,
}

/// Poll every tracked order once.
pub fn poll_once<B: BrokerApi>(
    dir: &StateDir,
    journal: &Journal<'_>,
    api: &B,
    mode: &str,
) -> Result<PollState> {
    let ts = utc_now();
    let mut store = load_open_orders(dir, mode)?;
    let order_ids: Vec<String> = store.orders.keys().cloned().collect();

    journal.record(
        "OMS_POLL",
        &ts.to_rfc3339(),
        "POLL_START",
        true,
        mode,
        "",
        json!({"n_orders": order_ids.len()}),
    );

    if order_ids.is_empty() {
        let state = PollState {
            ts,
            mode: mode.to_string(),
            ok: true,
            state: PollOutcome::NoOrders,
            n_orders: 0,
            changed: Vec::new(),
            pruned: Vec::new(),
            errors: Vec::new(),
        };
        dir.write_json_atomic(OMS_POLL_STATE, &state)?;
        journal.record("OMS_POLL", &ts.to_rfc3339(), "POLL_DONE", true, mode, "", json!({"n_orders": 0}));
        return Ok(state);
    }

    let mut changed = Vec::new();
    let mut pruned = Vec::new();
    let mut errors = Vec::new();

    for oid in &order_ids {
        let prev_status = store
            .orders
            .get(oid)
            .map(|o| norm_status(&o.status))
            .unwrap_or_else(|| "unknown".to_string());

        let snap = match api.get_order(oid) {
            Ok(snap) => snap,
            Err(e) => {
                let msg = format!("ORDER_ERROR:{oid}:{e}");
                errors.push(msg.clone());
                journal.record("OMS_POLL", &ts.to_rfc3339(), "ORDER_ERROR", false, mode, &msg, json!({"order_id": oid}));
                continue;
            }
        };
        let new_status = norm_status(&snap.status);

        let entry = store.orders.get_mut(oid).expect("tracked order present");
        entry.status = new_status.clone();
        entry.last_seen = ts;
        entry.raw = snap.raw;

        if new_status != prev_status {
            changed.push(PollChange {
                order_id: oid.clone(),
                prev: prev_status.clone(),
                new: new_status.clone(),
            });
            journal.record(
                "OMS_POLL",
                &ts.to_rfc3339(),
                "OPEN_POLL",
                true,
                mode,
                "",
                json!({"order_id": oid, "prev": &prev_status, "new": &new_status, "tag": &entry.tag}),
            );
        }

        // Alert once per (status, severity) pair.
        if let Some(sev) = severity_for(&new_status) {
            let mark = (new_status.clone(), sev.as_str().to_string());
            if entry.last_alert.as_ref() != Some(&mark) {
                entry.last_alert = Some(mark);
                tracing::warn!(order_id = %oid, status = %new_status, severity = sev.as_str(), "order alert");
                journal.record(
                    "OMS_POLL",
                    &ts.to_rfc3339(),
                    "ORDER_ALERT",
                    true,
                    mode,
                    "",
                    json!({"order_id": oid, "status": &new_status, "severity": sev}),
                );
            }
        }

        if is_terminal_status(&new_status) {
            store.orders.remove(oid);
            pruned.push(oid.clone());
        }
    }

    store.ts = ts;
    store.mode = mode.to_string();
    save_open_orders(dir, &store)?;

    let ok = errors.is_empty();
    let state = PollState {
        ts,
        mode: mode.to_string(),
        ok,
        state: if ok { PollOutcome::PollOk } else { PollOutcome::PollPartial },
        n_orders: order_ids.len(),
        changed,
        pruned,
        errors,
    };
    dir.write_json_atomic(OMS_POLL_STATE, &state)?;
    journal.record(
        "OMS_POLL",
        &ts.to_rfc3339(),
        "POLL_DONE",
        ok,
        mode,
        "",
        json!({"n_orders": state.n_orders, "changed": state.changed.len(), "pruned": state.pruned.len()}),
    );
    Ok(state)
}
