//! Append-only execution journal (JSON lines).
//!
//! Audit-only: nothing in the pipeline reads it back to make decisions. The
//! one hard requirement is that journaling can never fail a tick: an append
//! error is logged and swallowed, and event payloads are `serde_json::Value`
//! so there is no unserializable input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use odk_state::{utc_now, StateDir, EXECUTION_JOURNAL};

/// One audit event. `data` is free-form; producers put whatever context the
/// post-mortem needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub ts: DateTime<Utc>,
    pub intent_type: String,
    pub intent_ts: String,
    pub stage: String,
    pub ok: bool,
    pub mode: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

/// Build an event stamped now. `intent_ts` is carried as the producer's
/// string form so pre-rework intents journal unchanged.
#[allow(clippy::too_many_arguments)]
pub fn mk_event(
    intent_type: &str,
    intent_ts: &str,
    stage: &str,
    ok: bool,
    mode: &str,
    msg: &str,
    data: Value,
) -> JournalEvent {
    JournalEvent {
        ts: utc_now(),
        intent_type: intent_type.to_string(),
        intent_ts: intent_ts.to_string(),
        stage: stage.to_string(),
        ok,
        mode: mode.to_string(),
        msg: msg.to_string(),
        data,
    }
}

/// Writer handle for `execution_journal.jsonl`.
#[derive(Debug, Clone)]
pub struct Journal<'a> {
    dir: &'a StateDir,
}

impl<'a> Journal<'a> {
    pub fn new(dir: &'a StateDir) -> Self {
        Self { dir }
    }

    /// Append one event. Errors are logged, never propagated; the journal
    /// must not be able to halt execution.
    pub fn append(&self, event: &JournalEvent) {
        if let Err(e) = self.dir.append_jsonl(EXECUTION_JOURNAL, event) {
            tracing::warn!(stage = %event.stage, error = %e, "journal append failed (ignored)");
        }
    }

    /// Convenience: build and append in one call.
    pub fn record(
        &self,
        intent_type: &str,
        intent_ts: &str,
        stage: &str,
        ok: bool,
        mode: &str,
        msg: &str,
        data: Value,
    ) {
        self.append(&mk_event(intent_type, intent_ts, stage, ok, mode, msg, data));
    }

    /// Read the full journal back (used by tooling and tests, not by stages).
    pub fn read_all(&self) -> Vec<JournalEvent> {
        self.dir.read_jsonl(EXECUTION_JOURNAL).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_and_read_back() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let j = Journal::new(&sd);

        j.record(
            "OPEN_INTENT",
            "2026-03-20T12:00:00Z",
            "BROKER_TRANSLATE_SUBMIT",
            true,
            "PLAN_ONLY",
            "",
            json!({"candidate": "demo1"}),
        );
        j.record("OMS_POLL", "", "POLL_DONE", false, "LIVE", "timeout", Value::Null);

        let events = j.read_all();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage, "BROKER_TRANSLATE_SUBMIT");
        assert!(events[0].ok);
        assert_eq!(events[0].data["candidate"], "demo1");
        assert!(!events[1].ok);
    }

    #[test]
    fn append_into_unwritable_dir_does_not_panic() {
        // Root path that cannot be created: a file stands where the
        // directory should be.
        let td = tempfile::tempdir().unwrap();
        let blocker = td.path().join("blocked");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let sd = StateDir::new(&blocker);

        let j = Journal::new(&sd);
        j.record("X", "", "STAGE", true, "PLAN_ONLY", "", Value::Null);
        // No panic, no error surfaced: the journal swallows the failure.
    }

    #[test]
    fn events_survive_free_form_payloads() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let j = Journal::new(&sd);

        j.record(
            "DERISK_CLOSE",
            "x",
            "CLOSE_EXEC",
            true,
            "PLAN_ONLY",
            "",
            json!({"nested": {"deep": [1, 2.5, "s", null, true]}}),
        );
        let events = j.read_all();
        assert_eq!(events[0].data["nested"]["deep"][1], 2.5);
    }
}
