//! OPEN executor: consume `open_intent.json` through the broker seam.
//!
//! Consumption contract: the intent file is deleted only after the success
//! event has been journaled, so a crash between submit and delete is visible
//! in the journal and the retry path can deduplicate on the OPEN signature.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use odk_broker::{open_signature, Broker, BrokerApi, BrokerMode, OpenRequest, SubmitOutcome};
use odk_journal::Journal;
use odk_state::{utc_now, StateDir, OMS_OPEN_EXEC_STATE, OPEN_INTENT};

use crate::open::OpenIntent;
use crate::store::{load_open_orders, save_open_orders, TrackedOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenExecState {
    NoIntent,
    IntentInvalid,
    PlanOnlyTranslated,
    OpenSubmitted,
    DuplicateSuppressed,
    BrokerError,
}

/// The `oms_open_exec_state.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmsOpenExecState {
    pub ts: DateTime<Utc>,
    pub mode: String,
    pub state: OpenExecState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<SubmitOutcome>,
    pub intent_deleted: bool,
}

fn request_from_intent(intent: &OpenIntent) -> OpenRequest {
    let p = &intent.order_plan;
    OpenRequest {
        underlier: p.underlier.clone(),
        is_call: p.is_call,
        k_long: p.k_long,
        k_short: p.k_short,
        dte_days: p.dte_days,
        qty: p.qty,
        tag: p.tag.clone(),
    }
}

/// Run the executor once against the supplied broker.
pub fn run_open_exec<B: BrokerApi>(
    dir: &StateDir,
    journal: &Journal<'_>,
    broker: &Broker<B>,
) -> Result<OmsOpenExecState> {
    let mode = broker.mode().as_str().to_string();

    let Some(intent) = dir.read_json::<OpenIntent>(OPEN_INTENT)? else {
        let state = OmsOpenExecState {
            ts: utc_now(),
            mode,
            state: OpenExecState::NoIntent,
            reason: Some("NO_OPEN_INTENT".to_string()),
            intent_ts: None,
            candidate: None,
            broker: None,
            intent_deleted: false,
        };
        dir.write_json_atomic(OMS_OPEN_EXEC_STATE, &state)?;
        return Ok(state);
    };

    let intent_ts = intent.ts.to_rfc3339();
    journal.record(
        &intent.kind,
        &intent_ts,
        "OPEN_EXEC_START",
        true,
        &mode,
        "",
        json!({"candidate": intent.candidate}),
    );

    if intent.order_plan.qty <= 0 {
        let msg = "INVALID_INTENT_NONPOSITIVE_QTY";
        journal.record(&intent.kind, &intent_ts, "BROKER_TRANSLATE_SUBMIT", false, &mode, msg, json!({}));
        let state = OmsOpenExecState {
            ts: utc_now(),
            mode,
            state: OpenExecState::IntentInvalid,
            reason: Some(msg.to_string()),
            intent_ts: Some(intent.ts),
            candidate: Some(intent.candidate),
            broker: None,
            intent_deleted: false,
        };
        dir.write_json_atomic(OMS_OPEN_EXEC_STATE, &state)?;
        return Ok(state);
    }

    let req = request_from_intent(&intent);

    // Idempotent retry: an intent whose signature already has a live order
    // tracked (crash after submit, before delete) must not double-submit.
    if matches!(broker.mode(), BrokerMode::Live(_)) {
        if let Ok(resolved) = broker.api().resolve_vertical(&odk_broker::VerticalSpec {
            underlier: req.underlier.clone(),
            is_call: req.is_call,
            k_long: req.k_long,
            k_short: req.k_short,
            dte_days: req.dte_days,
        }) {
            let signature = open_signature(&req, resolved.expiration);
            let store = load_open_orders(dir, &mode)?;
            if store.has_active_signature(&signature) {
                journal.record(
                    &intent.kind,
                    &intent_ts,
                    "DUPLICATE_SUPPRESSED",
                    true,
                    &mode,
                    "",
                    json!({"signature": signature}),
                );
                let deleted = dir.delete(OPEN_INTENT)?;
                let state = OmsOpenExecState {
                    ts: utc_now(),
                    mode,
                    state: OpenExecState::DuplicateSuppressed,
                    reason: None,
                    intent_ts: Some(intent.ts),
                    candidate: Some(intent.candidate),
                    broker: None,
                    intent_deleted: deleted,
                };
                dir.write_json_atomic(OMS_OPEN_EXEC_STATE, &state)?;
                return Ok(state);
            }
        }
    }

    let outcome = broker.submit_open(&req);
    journal.record(
        &intent.kind,
        &intent_ts,
        "BROKER_TRANSLATE_SUBMIT",
        outcome.ok,
        &mode,
        outcome.error.as_deref().unwrap_or(""),
        json!({"broker_result": &outcome}),
    );

    let mut intent_deleted = false;
    if outcome.ok {
        // Journal success first, then consume.
        journal.record(&intent.kind, &intent_ts, "INTENT_CONSUME_OK", true, &mode, "", json!({}));
        intent_deleted = dir.delete(OPEN_INTENT)?;
    }

    if outcome.submitted {
        if let Some(order_id) = &outcome.order_id {
            let mut store = load_open_orders(dir, &mode)?;
            store.ts = utc_now();
            store.orders.insert(
                order_id.clone(),
                TrackedOrder {
                    order_id: order_id.clone(),
                    status: "new".to_string(),
                    last_seen: utc_now(),
                    tag: Some(req.tag.clone()),
                    signature: outcome.signature.clone(),
                    last_alert: None,
                    raw: serde_json::Value::Null,
                },
            );
            save_open_orders(dir, &store)?;
        }
    }

    let exec_state = if outcome.submitted {
        OpenExecState::OpenSubmitted
    } else if outcome.ok {
        OpenExecState::PlanOnlyTranslated
    } else {
        OpenExecState::BrokerError
    };

    let state = OmsOpenExecState {
        ts: utc_now(),
        mode,
        state: exec_state,
        reason: outcome.error.clone(),
        intent_ts: Some(intent.ts),
        candidate: Some(intent.candidate),
        broker: Some(outcome),
        intent_deleted,
    };
    dir.write_json_atomic(OMS_OPEN_EXEC_STATE, &state)?;
    Ok(state)
}
