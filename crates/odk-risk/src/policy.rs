//! Risk-policy configuration.
//!
//! Loaded from `configs/risk_policy.yaml`; unknown keys are ignored so the
//! file can grow ahead of the binary. Environment overrides happen at the
//! process edge (CLI), never here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Portfolio-wide hard limits on absolute greek totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_abs_delta: f64,
    pub max_abs_gamma: f64,
    pub max_abs_vega: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_abs_delta: 200.0,
            max_abs_gamma: 10.0,
            max_abs_vega: 20_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSpec {
    pub equity_usd: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerTradeLimits {
    pub max_defined_risk_pct_equity: f64,
    pub max_contracts_per_order: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionLimits {
    pub per_trade: PerTradeLimits,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IncrementalTradeLimits {
    pub max_incremental_loss_gap_10pct: f64,
    pub max_incremental_loss_combo_7pct_iv10: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScenarioLimits {
    pub incremental_trade: IncrementalTradeLimits,
}

/// The whole policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub account: AccountSpec,
    pub position_limits: PositionLimits,
    pub scenario_limits: ScenarioLimits,
    /// Optional portfolio-limit overrides; defaults apply when absent.
    #[serde(default)]
    pub portfolio_limits: Option<RiskLimits>,
}

impl RiskPolicy {
    pub fn portfolio_limits(&self) -> RiskLimits {
        self.portfolio_limits.unwrap_or_default()
    }
}

pub fn load_risk_policy(path: impl AsRef<Path>) -> Result<RiskPolicy> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read risk policy {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse risk policy {}", path.display()))
}
