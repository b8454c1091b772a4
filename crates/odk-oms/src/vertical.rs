//! Leg-sequencing OPEN state machine.
//!
//! ```text
//! INIT → SUBMIT_LONG → SUBMIT_SHORT → DONE
//!   ↓         ↓             ↓
//!  HALT     FAIL          FAIL     (risk-mode HALT, LIVE disabled, timeout)
//! ```
//!
//! Every transition writes a durable snapshot before advancing, so an
//! operator can always see the last state the machine reached. Plan-only
//! transitions record simulated fills straight into the positions ledger.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use odk_portfolio::{record_fill, Side};
use odk_state::{utc_now, RiskMode, RiskModeStore, StateDir, OMS_VERTICAL_STATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerticalState {
    Init,
    SubmitLong,
    SubmitShort,
    Done,
    Halt,
    Fail,
}

impl VerticalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VerticalState::Done | VerticalState::Halt | VerticalState::Fail)
    }
}

/// One leg as priced by the planning layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegOrder {
    pub symbol: String,
    pub qty: i64,
    pub limit: f64,
}

/// The two legs of the vertical to work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerticalPlan {
    pub long: LegOrder,
    pub short: LegOrder,
}

#[derive(Debug, Clone, Copy)]
pub struct VerticalConfig {
    pub plan_only: bool,
    /// Wall-clock budget for the whole machine.
    pub max_seconds: u64,
}

impl Default for VerticalConfig {
    fn default() -> Self {
        Self {
            plan_only: true,
            max_seconds: 60,
        }
    }
}

/// The `oms_state.json` record, rewritten at every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerticalSnapshot {
    pub ts: DateTime<Utc>,
    pub mode: String,
    pub risk_mode: RiskMode,
    pub state: VerticalState,
    pub elapsed_sec: u64,
    pub filled_long: i64,
    pub filled_short: i64,
    pub working: VerticalPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Drive the machine to a terminal state.
pub fn run_vertical_open(
    dir: &StateDir,
    plan: &VerticalPlan,
    cfg: &VerticalConfig,
) -> Result<VerticalSnapshot> {
    let mode = if cfg.plan_only { "PLAN_ONLY" } else { "LIVE" };
    let started = Instant::now();

    let mut state = VerticalState::Init;
    let mut filled_long = 0i64;
    let mut filled_short = 0i64;
    let mut reason: Option<String> = None;

    loop {
        let elapsed = started.elapsed().as_secs();
        let risk_mode = RiskModeStore::new(dir).load().mode;

        // Cooperative cancellation: checked at every transition boundary.
        if !state.is_terminal() {
            if risk_mode == RiskMode::Halt {
                state = VerticalState::Halt;
                reason = Some("RISK_MODE_HALT".to_string());
            } else if elapsed > cfg.max_seconds {
                state = VerticalState::Fail;
                reason = Some("TIMEOUT".to_string());
            }
        }

        let snapshot = VerticalSnapshot {
            ts: utc_now(),
            mode: mode.to_string(),
            risk_mode,
            state,
            elapsed_sec: elapsed,
            filled_long,
            filled_short,
            working: plan.clone(),
            reason: reason.clone(),
        };
        dir.write_json_atomic(OMS_VERTICAL_STATE, &snapshot)?;

        if state.is_terminal() {
            tracing::info!(state = ?state, reason = ?reason, "vertical OPEN machine finished");
            return Ok(snapshot);
        }

        match state {
            VerticalState::Init => state = VerticalState::SubmitLong,

            VerticalState::SubmitLong => {
                if cfg.plan_only {
                    filled_long = plan.long.qty;
                    record_fill(
                        dir,
                        &plan.long.symbol,
                        filled_long,
                        Side::Buy,
                        plan.long.limit,
                        "OMS_LONG_FILL_SIM",
                    )?;
                    state = VerticalState::SubmitShort;
                } else {
                    state = VerticalState::Fail;
                    reason = Some("LIVE_MODE_NOT_ENABLED".to_string());
                }
            }

            VerticalState::SubmitShort => {
                if cfg.plan_only {
                    filled_short = filled_long;
                    record_fill(
                        dir,
                        &plan.short.symbol,
                        filled_short,
                        Side::Sell,
                        plan.short.limit,
                        "OMS_SHORT_FILL_SIM",
                    )?;
                    state = VerticalState::Done;
                } else {
                    state = VerticalState::Fail;
                    reason = Some("LIVE_MODE_NOT_ENABLED".to_string());
                }
            }

            VerticalState::Done | VerticalState::Halt | VerticalState::Fail => unreachable!(),
        }
    }
}
