//! Risk-mode store: the global trading permission level.
//!
//! Ownership: the risk evaluator writes limits-based transitions, the de-risk
//! layer writes partial-success downgrades. Everyone else reads.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{utc_now, StateDir, RISK_MODE};

/// Global trading permission level.
///
/// `Unknown` means the mode file is missing or unreadable; consumers treat it
/// exactly like `Halt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskMode {
    Normal,
    Degraded,
    Halt,
    #[serde(other)]
    Unknown,
}

impl RiskMode {
    /// New risk may be opened only in NORMAL.
    pub fn allow_open(self) -> bool {
        matches!(self, RiskMode::Normal)
    }

    /// Risk may be reduced in NORMAL and DEGRADED. HALT blocks closes too
    /// (emergency close is a separate, out-of-band concern).
    pub fn allow_close(self) -> bool {
        matches!(self, RiskMode::Normal | RiskMode::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskMode::Normal => "NORMAL",
            RiskMode::Degraded => "DEGRADED",
            RiskMode::Halt => "HALT",
            RiskMode::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable `{ts, mode, reason}` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskModeState {
    pub ts: DateTime<Utc>,
    pub mode: RiskMode,
    pub reason: String,
}

/// Typed access to `risk_mode.json`.
#[derive(Debug, Clone)]
pub struct RiskModeStore<'a> {
    dir: &'a StateDir,
}

impl<'a> RiskModeStore<'a> {
    pub fn new(dir: &'a StateDir) -> Self {
        Self { dir }
    }

    /// Read the current mode. Missing or unreadable state maps to `Unknown`
    /// (fail-closed: consumers treat it as HALT).
    pub fn load(&self) -> RiskModeState {
        match self.dir.read_json::<RiskModeState>(RISK_MODE) {
            Ok(Some(state)) => state,
            Ok(None) => RiskModeState {
                ts: utc_now(),
                mode: RiskMode::Unknown,
                reason: "missing_risk_mode_file".to_string(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "risk_mode.json unreadable; treating as UNKNOWN");
                RiskModeState {
                    ts: utc_now(),
                    mode: RiskMode::Unknown,
                    reason: "unreadable_risk_mode_file".to_string(),
                }
            }
        }
    }

    /// Like [`load`], but initializes the file to NORMAL/boot when absent
    /// (first-boot lifecycle).
    pub fn load_or_boot(&self) -> Result<RiskModeState> {
        if !self.dir.exists(RISK_MODE) {
            self.set(RiskMode::Normal, "boot")?;
        }
        Ok(self.load())
    }

    /// Atomically rewrite the mode file.
    pub fn set(&self, mode: RiskMode, reason: impl Into<String>) -> Result<RiskModeState> {
        let state = RiskModeState {
            ts: utc_now(),
            mode,
            reason: reason.into(),
        };
        self.dir.write_json_atomic(RISK_MODE, &state)?;
        tracing::info!(mode = %state.mode, reason = %state.reason, "risk mode set");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gating_table() {
        assert!(RiskMode::Normal.allow_open());
        assert!(RiskMode::Normal.allow_close());
        assert!(!RiskMode::Degraded.allow_open());
        assert!(RiskMode::Degraded.allow_close());
        assert!(!RiskMode::Halt.allow_open());
        assert!(!RiskMode::Halt.allow_close());
        assert!(!RiskMode::Unknown.allow_open());
        assert!(!RiskMode::Unknown.allow_close());
    }

    #[test]
    fn missing_file_is_unknown() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let st = RiskModeStore::new(&sd).load();
        assert_eq!(st.mode, RiskMode::Unknown);
    }

    #[test]
    fn boot_initializes_normal() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let st = RiskModeStore::new(&sd).load_or_boot().unwrap();
        assert_eq!(st.mode, RiskMode::Normal);
        assert_eq!(st.reason, "boot");
    }

    #[test]
    fn set_then_load_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        let store = RiskModeStore::new(&sd);
        store.set(RiskMode::Halt, "DELTA_LIMIT 250.00 > 200.0").unwrap();
        let st = store.load();
        assert_eq!(st.mode, RiskMode::Halt);
        assert!(st.reason.contains("DELTA_LIMIT"));
    }

    #[test]
    fn unrecognized_mode_string_maps_to_unknown() {
        let td = tempfile::tempdir().unwrap();
        let sd = StateDir::new(td.path());
        std::fs::write(
            sd.path(RISK_MODE),
            r#"{"ts":"2026-03-20T12:00:00Z","mode":"WEIRD","reason":"x"}"#,
        )
        .unwrap();
        let st = RiskModeStore::new(&sd).load();
        assert_eq!(st.mode, RiskMode::Unknown);
    }
}
