//! Pricing primitives for the options control plane.
//!
//! Pure math, no IO: European Black–Scholes (no dividends), per-contract
//! greeks at the US equity multiplier of 100, a two-stage implied-volatility
//! solver (Newton then bracketed bisection), and the scenario grid the
//! pre-trade gateway uses for worst-case sizing.
//!
//! # Unit conventions (load-bearing)
//!
//! - `vega_per_vol` is dollars per **1.00** of volatility (100 vol points),
//!   NOT per vol point. The de-risk score weights assume this.
//! - `theta_per_year` is dollars per year (negative = decay).
//!
//! Downstream consumers must not rescale these without renaming the fields.

mod bs;
mod iv;
mod scenario;

pub use bs::{bs_d1_d2, bs_price, contract_greeks, norm_cdf, norm_pdf, ContractGreeks, CONTRACT_MULTIPLIER};
pub use iv::{implied_vol, implied_vol_bisect, implied_vol_newton, IvMethod, IvSolve};
pub use scenario::{incremental_worst_losses, scenario_grid, structure_value, Leg, ScenarioPnl};
