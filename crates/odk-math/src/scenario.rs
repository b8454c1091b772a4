//! Scenario grid: revalue a multi-leg structure under spot and vol shocks.

use crate::bs::{bs_price, CONTRACT_MULTIPLIER};

/// One leg of a structure. `side` is +1 for long, -1 for short; `qty` is a
/// positive contract count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leg {
    pub k: f64,
    pub is_call: bool,
    pub qty: i64,
    pub side: i64,
    pub iv: f64,
}

/// PnL of the structure at one grid point, relative to the unshocked value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioPnl {
    pub spot: f64,
    pub iv_shift: f64,
    pub pnl: f64,
}

/// Present value of the structure in dollars. `iv_shift` is additive in vol
/// decimals (+0.10 = +10 vol points); shifted vols are floored just above
/// zero.
pub fn structure_value(s: f64, r: f64, t: f64, legs: &[Leg], iv_shift: f64) -> f64 {
    legs.iter()
        .map(|leg| {
            let sigma = (leg.iv + iv_shift).max(1e-6);
            let px = bs_price(s, leg.k, r, sigma, t, leg.is_call);
            (leg.side * leg.qty) as f64 * CONTRACT_MULTIPLIER * px
        })
        .sum()
}

/// Revalue under the cross product of relative spot shocks and additive vol
/// shocks. PnL at each point is against the unshocked value at `s0`.
pub fn scenario_grid(
    s0: f64,
    r: f64,
    t: f64,
    legs: &[Leg],
    spot_shocks: &[f64],
    iv_shocks: &[f64],
) -> Vec<ScenarioPnl> {
    let v0 = structure_value(s0, r, t, legs, 0.0);
    let mut out = Vec::with_capacity(spot_shocks.len() * iv_shocks.len());
    for &ds in spot_shocks {
        let s = s0 * (1.0 + ds);
        for &dv in iv_shocks {
            let v = structure_value(s, r, t, legs, dv);
            out.push(ScenarioPnl {
                spot: s,
                iv_shift: dv,
                pnl: v - v0,
            });
        }
    }
    out
}

/// The gateway's two stress scenarios on one structure:
///
/// - gap: spot ±10%, no vol shock;
/// - combo: spot ±7% with vols up 10 points.
///
/// Returns the worst PnL of each family.
pub fn incremental_worst_losses(s0: f64, r: f64, t: f64, legs: &[Leg]) -> (f64, f64) {
    let gap = scenario_grid(s0, r, t, legs, &[-0.10, 0.10], &[0.0]);
    let worst_gap = gap.iter().map(|x| x.pnl).fold(f64::INFINITY, f64::min);

    let combo = scenario_grid(s0, r, t, legs, &[-0.07, 0.07], &[0.10]);
    let worst_combo = combo.iter().map(|x| x.pnl).fold(f64::INFINITY, f64::min);

    (worst_gap, worst_combo)
}
