//! Portfolio greeks builder.
//!
//! For each non-flat position: decode the OCC symbol, pick a spot for its
//! underlier, back-solve implied vol from the last-known option mid, compute
//! per-contract greeks and weight by net quantity. Failures to solve degrade
//! to a configured default vol with `FALLBACK_DEFAULT` provenance; the risk
//! evaluator downgrades the whole system on seeing that tag.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use odk_math::{contract_greeks, implied_vol, IvMethod};
use odk_state::{utc_now, StateDir, MARKET_STATE, PORTFOLIO_GREEKS, POSITIONS_BOOK};
use odk_symbols::parse_occ;

use crate::types::{
    GreeksSnapshot, GreeksTotals, IvSource, MarketState, PositionGreeksRow, PositionsBook,
    UnderlierQuote,
};

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;
/// Underlier quote spreads above this don't qualify the mid as a spot source.
const SPOT_MID_MAX_SPREAD_PCT: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
pub struct GreeksConfig {
    /// Risk-free rate used in pricing and IV back-solves.
    pub r: f64,
    /// Vol assumed when the solver cannot recover one.
    pub default_iv: f64,
}

impl Default for GreeksConfig {
    fn default() -> Self {
        Self {
            r: 0.0,
            default_iv: 0.25,
        }
    }
}

/// Spot for an underlier: the quote mid when the spread is tight enough,
/// otherwise the reported (trade) spot.
fn select_spot(q: &UnderlierQuote) -> (Option<f64>, Option<String>) {
    if let (Some(bid), Some(ask)) = (q.bid, q.ask) {
        if bid > 0.0 && ask >= bid {
            let mid = 0.5 * (bid + ask);
            let spr_pct = if mid > 0.0 { (ask - bid) / mid * 100.0 } else { f64::MAX };
            if spr_pct <= SPOT_MID_MAX_SPREAD_PCT {
                return (Some(mid), Some("MID".to_string()));
            }
        }
    }
    (
        q.spot,
        q.spot_src.clone().or_else(|| Some("TRADE".to_string())),
    )
}

/// Year fraction to expiry, measured to 16:00 UTC on the expiry date,
/// floored at zero.
fn yearfrac_to_expiry(exp: chrono::NaiveDate, now: DateTime<Utc>) -> f64 {
    let close = exp.and_hms_opt(16, 0, 0).expect("16:00 is valid").and_utc();
    let secs = (close - now).num_seconds() as f64;
    (secs / SECONDS_PER_YEAR).max(0.0)
}

/// Pure snapshot construction; `build_portfolio_greeks` wires the files.
pub fn build_snapshot(
    book: &PositionsBook,
    market: &MarketState,
    prev: Option<&GreeksSnapshot>,
    cfg: &GreeksConfig,
    now: DateTime<Utc>,
) -> GreeksSnapshot {
    // Last-known mid/spread per symbol, preserved across ticks so greeks can
    // recompute consistently between option-quote refreshes.
    let prev_mids: HashMap<&str, (f64, f64)> = prev
        .map(|p| {
            p.positions
                .iter()
                .map(|r| (r.symbol.as_str(), (r.mid, r.spr_pct)))
                .collect()
        })
        .unwrap_or_default();

    let mut rows = Vec::new();
    let mut totals = GreeksTotals::default();

    for pos in &book.positions {
        if pos.net_qty == 0 {
            continue;
        }
        let occ = match parse_occ(&pos.symbol) {
            Ok(occ) => occ,
            Err(e) => {
                tracing::warn!(symbol = %pos.symbol, error = %e, "skipping undecodable symbol");
                continue;
            }
        };

        let (spot, spot_src) = market
            .symbols
            .get(&occ.root)
            .map(select_spot)
            .unwrap_or((None, None));
        let spot_val = spot.unwrap_or(0.0);

        let t = yearfrac_to_expiry(occ.expiry, now);
        let (mid, spr_pct) = prev_mids.get(pos.symbol.as_str()).copied().unwrap_or((0.0, 0.0));

        let solved = if mid > 0.0 && spot_val > 0.0 && t > 0.0 {
            implied_vol(mid, spot_val, occ.strike, t, cfg.r, occ.is_call)
        } else {
            None
        };
        let (iv, iv_src) = match solved {
            Some(s) => (
                s.sigma,
                match s.method {
                    IvMethod::Newton => IvSource::Newton,
                    IvMethod::Bisect => IvSource::Bisect,
                },
            ),
            None => (cfg.default_iv, IvSource::FallbackDefault),
        };

        let t_for_greeks = if t > 0.0 { t } else { 1e-9 };
        let g = contract_greeks(spot_val, occ.strike, cfg.r, iv, t_for_greeks, occ.is_call);

        let nq = pos.net_qty as f64;
        let row = PositionGreeksRow {
            symbol: pos.symbol.clone(),
            underlier: occ.root,
            exp: occ.expiry,
            is_call: occ.is_call,
            strike: occ.strike,
            spot: if spot_val > 0.0 { Some(spot_val) } else { None },
            spot_src,
            net_qty: pos.net_qty,
            mid,
            spr_pct,
            iv,
            iv_src,
            delta: g.delta * nq,
            gamma: g.gamma * nq,
            vega: g.vega_per_vol * nq,
            theta: g.theta_per_year * nq,
        };

        totals.delta += row.delta;
        totals.gamma += row.gamma;
        totals.vega += row.vega;
        totals.theta += row.theta;
        rows.push(row);
    }

    GreeksSnapshot {
        ts: now,
        positions: rows,
        totals,
    }
}

/// Build the snapshot from state files and atomically rewrite
/// `portfolio_greeks.json`. Missing book or market state is treated as empty
/// (first boot produces an empty snapshot, not a failure).
pub fn build_portfolio_greeks(dir: &StateDir, cfg: &GreeksConfig) -> Result<GreeksSnapshot> {
    let book: PositionsBook = dir
        .read_json(POSITIONS_BOOK)?
        .unwrap_or_else(|| PositionsBook {
            ts: utc_now(),
            positions: Vec::new(),
        });
    let market: MarketState = dir.read_json(MARKET_STATE)?.unwrap_or_default();
    let prev: Option<GreeksSnapshot> = dir.read_json(PORTFOLIO_GREEKS)?;

    let snap = build_snapshot(&book, &market, prev.as_ref(), cfg, utc_now());
    dir.write_json_atomic(PORTFOLIO_GREEKS, &snap)?;
    tracing::info!(
        positions = snap.positions.len(),
        delta = snap.totals.delta,
        vega = snap.totals.vega,
        "portfolio greeks rebuilt"
    );
    Ok(snap)
}
