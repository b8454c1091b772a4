//! Bounded de-risk loop driver.
//!
//! Re-enters greeks → risk-eval → plan → exec → close until the mode leaves
//! HALT or the round cap is hit. Modeled as a plain bounded loop returning
//! the per-round history; no recursion between the stages.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use odk_journal::Journal;
use odk_oms::CloseConfig;
use odk_portfolio::GreeksConfig;
use odk_risk::RiskLimits;
use odk_state::{utc_now, RiskMode, StateDir};

pub const DEFAULT_MAX_ROUNDS: u32 = 5;

#[derive(Debug, Clone)]
pub struct DeriskLoopConfig {
    pub greeks: GreeksConfig,
    pub limits: RiskLimits,
    pub buffer_pct: f64,
    pub max_contracts_to_close: i64,
    pub close: CloseConfig,
    pub max_rounds: u32,
}

impl Default for DeriskLoopConfig {
    fn default() -> Self {
        Self {
            greeks: GreeksConfig::default(),
            limits: RiskLimits::default(),
            buffer_pct: odk_risk::DEFAULT_BUFFER_PCT,
            max_contracts_to_close: odk_risk::DEFAULT_MAX_CONTRACTS_TO_CLOSE,
            close: CloseConfig::default(),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

/// One round of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriskRound {
    pub round: u32,
    pub ts: DateTime<Utc>,
    pub mode: RiskMode,
    pub breaches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriskLoopReport {
    pub ts: DateTime<Utc>,
    pub rounds: Vec<DeriskRound>,
    /// Mode after the final round.
    pub final_mode: RiskMode,
}

/// Run the loop. Each round re-derives greeks from the (possibly reduced)
/// book, re-evaluates, and, while still in HALT, plans and executes one
/// more batch of closes.
pub fn run_derisk_loop(dir: &StateDir, cfg: &DeriskLoopConfig) -> Result<DeriskLoopReport> {
    let journal = Journal::new(dir);
    let mut rounds = Vec::new();
    let mut final_mode = RiskMode::Unknown;

    for round in 1..=cfg.max_rounds.max(1) {
        odk_portfolio::build_portfolio_greeks(dir, &cfg.greeks)?;
        let eval = odk_risk::evaluate_portfolio(dir, &cfg.limits)?;

        final_mode = eval.mode_decision;
        rounds.push(DeriskRound {
            round,
            ts: utc_now(),
            mode: eval.mode_decision,
            breaches: eval.breaches.clone(),
        });

        if eval.mode_decision != RiskMode::Halt {
            break;
        }

        tracing::warn!(round, breaches = ?eval.breaches, "still over limits; de-risking");
        odk_risk::run_derisk_plan(dir, &cfg.limits, cfg.buffer_pct, cfg.max_contracts_to_close)?;
        odk_risk::execute_derisk_plan(dir)?;
        odk_oms::run_close(dir, &journal, &cfg.close)?;
    }

    Ok(DeriskLoopReport {
        ts: utc_now(),
        rounds,
        final_mode,
    })
}
