//! Single-shot pipeline orchestrator.
//!
//! One tick runs the stages in dependency order under an exclusive process
//! lock:
//!
//! ```text
//! ledger → greeks → risk-eval → derisk-plan → derisk-exec
//!        → gateway → open → open-exec → close
//! ```
//!
//! Stage outcomes are classified, not thrown: `NoInput` and `Reject` are
//! ordinary per-stage states and the tick continues; only a `Fatal` error
//! (I/O failure, corrupt state) aborts the remaining stages. The tick
//! summary is written in every case, including `LOCKED` contention.

mod derisk_loop;

pub use derisk_loop::{run_derisk_loop, DeriskLoopConfig, DeriskLoopReport, DeriskRound};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use odk_broker::{Broker, BrokerApi};
use odk_gateway::{GateConfig, VerticalIntent};
use odk_journal::Journal;
use odk_oms::{CloseConfig, CloseState, OpenExecState};
use odk_portfolio::GreeksConfig;
use odk_risk::RiskLimits;
use odk_state::{utc_now, RiskModeState, RiskModeStore, StateDir, CLOSE_INTENT, GATE_OUT, OPEN_INTENT, TICK_LOCK, TICK_STATE};

/// Everything a tick needs, resolved at the process edge.
#[derive(Debug, Clone)]
pub struct TickConfig {
    pub greeks: GreeksConfig,
    pub limits: RiskLimits,
    pub buffer_pct: f64,
    pub max_contracts_to_close: i64,
    pub gate: GateConfig,
    pub close: CloseConfig,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            greeks: GreeksConfig::default(),
            limits: RiskLimits::default(),
            buffer_pct: odk_risk::DEFAULT_BUFFER_PCT,
            max_contracts_to_close: odk_risk::DEFAULT_MAX_CONTRACTS_TO_CLOSE,
            gate: GateConfig::default(),
            close: CloseConfig::default(),
        }
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome {
    Ok,
    NoInput,
    Reject,
    Fatal,
}

/// One stage's report inside the tick summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub critical: bool,
    pub ok: bool,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickOutcome {
    Ok,
    Locked,
    Halted,
}

/// Final-state digest appended to the tick summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_mode: Option<RiskModeState>,
    pub open_intent_present: bool,
    pub close_intent_present: bool,
    pub gate_out_present: bool,
}

/// The `tick_state.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickState {
    pub ts: DateTime<Utc>,
    pub ok: bool,
    pub state: TickOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<String>,
    pub elapsed_ms: u64,
    pub steps: Vec<StageReport>,
    pub summary: TickSummary,
}

/// What a stage closure reports back on success.
pub struct StageStatus {
    pub outcome: StageOutcome,
    pub detail: Option<String>,
}

impl StageStatus {
    pub fn ok() -> Self {
        Self {
            outcome: StageOutcome::Ok,
            detail: None,
        }
    }

    pub fn ok_with(detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::Ok,
            detail: Some(detail.into()),
        }
    }

    pub fn no_input(detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::NoInput,
            detail: Some(detail.into()),
        }
    }

    pub fn reject(detail: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::Reject,
            detail: Some(detail.into()),
        }
    }
}

fn run_stage(
    name: &str,
    critical: bool,
    f: impl FnOnce() -> Result<StageStatus>,
) -> StageReport {
    let t0 = Instant::now();
    match f() {
        Ok(status) => StageReport {
            name: name.to_string(),
            critical,
            ok: true,
            outcome: status.outcome,
            detail: status.detail,
            error: None,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        },
        Err(e) => {
            tracing::error!(stage = name, error = %format!("{e:#}"), "stage failed");
            StageReport {
                name: name.to_string(),
                critical,
                ok: false,
                outcome: StageOutcome::Fatal,
                detail: None,
                // Context chain tail, the way a post-mortem wants it.
                error: Some(format!("{e:#}")),
                elapsed_ms: t0.elapsed().as_millis() as u64,
            }
        }
    }
}

fn summarize(dir: &StateDir) -> TickSummary {
    TickSummary {
        risk_mode: dir.read_json(odk_state::RISK_MODE).ok().flatten(),
        open_intent_present: dir.exists(OPEN_INTENT),
        close_intent_present: dir.exists(CLOSE_INTENT),
        gate_out_present: dir.exists(GATE_OUT),
    }
}

/// Run one tick. Returns the written tick state; callers exit zero on any
/// completed tick (HALT outcomes included) and non-zero only when the state
/// write itself failed.
pub fn run_tick<B: BrokerApi>(
    dir: &StateDir,
    cfg: &TickConfig,
    intents: &[(String, VerticalIntent)],
    broker: &Broker<B>,
) -> Result<TickState> {
    let t0 = Instant::now();

    let Some(_lock) = dir.try_lock(TICK_LOCK)? else {
        let state = TickState {
            ts: utc_now(),
            ok: false,
            state: TickOutcome::Locked,
            halted_by: Some("ANOTHER_TICK_RUNNING".to_string()),
            elapsed_ms: t0.elapsed().as_millis() as u64,
            steps: Vec::new(),
            summary: summarize(dir),
        };
        dir.write_json_atomic(TICK_STATE, &state)?;
        tracing::warn!("tick lock contended");
        return Ok(state);
    };

    RiskModeStore::new(dir).load_or_boot()?;
    let journal = Journal::new(dir);

    let mut steps: Vec<StageReport> = Vec::new();
    let mut halted_by: Option<String> = None;

    macro_rules! stage {
        ($name:expr, $body:expr) => {
            if halted_by.is_none() {
                let report = run_stage($name, true, $body);
                let fatal = report.outcome == StageOutcome::Fatal;
                if fatal {
                    halted_by = Some($name.to_string());
                }
                steps.push(report);
            }
        };
    }

    stage!("portfolio.ledger", || {
        let book = odk_portfolio::rebuild_positions_book(dir)?;
        Ok(StageStatus::ok_with(format!("{} positions", book.positions.len())))
    });

    stage!("portfolio.greeks", || {
        let snap = odk_portfolio::build_portfolio_greeks(dir, &cfg.greeks)?;
        Ok(StageStatus::ok_with(format!(
            "delta={:.2} gamma={:.2} vega={:.2}",
            snap.totals.delta, snap.totals.gamma, snap.totals.vega
        )))
    });

    stage!("risk.evaluate", || {
        let eval = odk_risk::evaluate_portfolio(dir, &cfg.limits)?;
        Ok(StageStatus::ok_with(format!("{}", eval.mode_decision)))
    });

    stage!("risk.derisk_plan", || {
        let plan = odk_risk::run_derisk_plan(dir, &cfg.limits, cfg.buffer_pct, cfg.max_contracts_to_close)?;
        Ok(StageStatus::ok_with(format!("{:?} {} actions", plan.status, plan.actions.len())))
    });

    stage!("risk.derisk_exec", || {
        let out = odk_risk::execute_derisk_plan(dir)?;
        Ok(match out.status {
            odk_risk::DeriskExecStatus::WroteIntent => StageStatus::ok_with("close intent written"),
            odk_risk::DeriskExecStatus::NoExec => {
                StageStatus::no_input(out.reason.unwrap_or_else(|| "NO_ACTIONS".to_string()))
            }
        })
    });

    stage!("gateway", || {
        let out = odk_gateway::run_gateway(dir, intents, &cfg.gate)?;
        let allowed = out.out.values().filter(|c| c.allow).count();
        Ok(StageStatus::ok_with(format!("{}/{} allowed", allowed, out.out.len())))
    });

    stage!("oms.open", || {
        let st = odk_oms::run_open_issuer(dir)?;
        Ok(match st.state {
            odk_oms::OpenIssuerState::Done => StageStatus::ok(),
            other => StageStatus::reject(format!("{other:?}")),
        })
    });

    stage!("oms.open_exec", || {
        let st = odk_oms::run_open_exec(dir, &journal, broker)?;
        Ok(match st.state {
            OpenExecState::NoIntent => StageStatus::no_input("NO_OPEN_INTENT"),
            OpenExecState::IntentInvalid | OpenExecState::BrokerError => {
                StageStatus::reject(st.reason.unwrap_or_else(|| format!("{:?}", st.state)))
            }
            _ => StageStatus::ok_with(format!("{:?}", st.state)),
        })
    });

    stage!("oms.close", || {
        let st = odk_oms::run_close(dir, &journal, &cfg.close)?;
        Ok(match st.state {
            CloseState::NoIntent => StageStatus::no_input("NO_CLOSE_INTENT"),
            CloseState::Reject => StageStatus::reject(st.reason.unwrap_or_default()),
            CloseState::Locked => StageStatus::reject("LOCKED"),
            _ => StageStatus::ok_with(format!("{} steps", st.steps.len())),
        })
    });

    let ok = halted_by.is_none();
    let state = TickState {
        ts: utc_now(),
        ok,
        state: if ok { TickOutcome::Ok } else { TickOutcome::Halted },
        halted_by,
        elapsed_ms: t0.elapsed().as_millis() as u64,
        steps,
        summary: summarize(dir),
    };
    dir.write_json_atomic(TICK_STATE, &state)?;
    tracing::info!(ok = state.ok, halted_by = ?state.halted_by, "tick complete");
    Ok(state)
}
