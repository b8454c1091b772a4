//! Black–Scholes pricing and per-contract greeks.

/// US equity options: 100 shares per contract.
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

const SQRT_2PI: f64 = 2.506_628_274_631_000_5;
const FRAC_1_SQRT_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Error function via the Abramowitz–Stegun 7.1.26 rational approximation.
///
/// Max absolute error ~1.5e-7, which is far inside the tolerances the IV
/// solver works to. Exactly odd (sign handled by reflection), so
/// `norm_cdf(x) + norm_cdf(-x) == 1.0` holds to machine precision; the
/// put-call parity tests depend on that.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// Standard normal CDF.
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x * FRAC_1_SQRT_2))
}

/// Standard normal PDF.
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / SQRT_2PI
}

/// `(d1, d2)` for the given parameters, or `None` when any of
/// `S, K, T, sigma` is non-positive (degenerate regime).
pub fn bs_d1_d2(s: f64, k: f64, r: f64, sigma: f64, t: f64) -> Option<(f64, f64)> {
    if s <= 0.0 || k <= 0.0 || t <= 0.0 || sigma <= 0.0 {
        return None;
    }
    let vsqrt = sigma * t.sqrt();
    let d1 = ((s / k).ln() + (r + 0.5 * sigma * sigma) * t) / vsqrt;
    Some((d1, d1 - vsqrt))
}

fn intrinsic(s: f64, k: f64, is_call: bool) -> f64 {
    if is_call {
        (s - k).max(0.0)
    } else {
        (k - s).max(0.0)
    }
}

/// European Black–Scholes price per share, no dividends.
///
/// Degenerate inputs (`S, K, T, sigma <= 0`) price at intrinsic value.
pub fn bs_price(s: f64, k: f64, r: f64, sigma: f64, t: f64, is_call: bool) -> f64 {
    let Some((d1, d2)) = bs_d1_d2(s, k, r, sigma, t) else {
        return intrinsic(s, k, is_call);
    };
    let df = (-r * t).exp();
    if is_call {
        s * norm_cdf(d1) - k * df * norm_cdf(d2)
    } else {
        k * df * norm_cdf(-d2) - s * norm_cdf(-d1)
    }
}

/// Greeks for ONE contract (multiplier already applied).
///
/// Field names carry the unit conventions; see the crate docs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractGreeks {
    /// Share-equivalent delta ($ per $1 spot move).
    pub delta: f64,
    /// Share-equivalent gamma per $ spot move.
    pub gamma: f64,
    /// Dollars per 1.00 of volatility (per 100 vol points).
    pub vega_per_vol: f64,
    /// Dollars per year; negative means decay.
    pub theta_per_year: f64,
}

/// Per-contract Black–Scholes greeks at multiplier 100.
///
/// Degenerate inputs collapse to an intrinsic-style stance: delta snaps to
/// ±100 when the option is in the money, everything else is zero.
pub fn contract_greeks(s: f64, k: f64, r: f64, sigma: f64, t: f64, is_call: bool) -> ContractGreeks {
    let mult = CONTRACT_MULTIPLIER;

    let Some((d1, d2)) = bs_d1_d2(s, k, r, sigma, t) else {
        let delta = if is_call && s > k {
            mult
        } else if !is_call && s < k {
            -mult
        } else {
            0.0
        };
        return ContractGreeks {
            delta,
            gamma: 0.0,
            vega_per_vol: 0.0,
            theta_per_year: 0.0,
        };
    };

    let pdf1 = norm_pdf(d1);
    let df = (-r * t).exp();
    let sqrt_t = t.sqrt();

    let delta = if is_call {
        mult * norm_cdf(d1)
    } else {
        mult * (norm_cdf(d1) - 1.0)
    };

    let gamma = mult * pdf1 / (s * sigma * sqrt_t);
    let vega_per_vol = mult * s * pdf1 * sqrt_t;

    let theta_per_year = if is_call {
        mult * (-(s * pdf1 * sigma) / (2.0 * sqrt_t) - r * k * df * norm_cdf(d2))
    } else {
        mult * (-(s * pdf1 * sigma) / (2.0 * sqrt_t) + r * k * df * norm_cdf(-d2))
    };

    ContractGreeks {
        delta,
        gamma,
        vega_per_vol,
        theta_per_year,
    }
}
