//! Deterministic in-process broker for plan-only runs and tests.

use chrono::{Duration, NaiveDate};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use odk_symbols::OccSymbol;

use crate::{
    BrokerApi, BrokerError, OrderLeg, OrderSnapshot, ResolvedVertical, TimeInForce, VerticalSpec,
};

const STRIKE_TOL: f64 = 1e-6;
const EXPIRATION_WINDOW_DAYS: i64 = 10;

/// Paper broker.
///
/// Resolution: with a configured chain it behaves like a real refdata lookup
/// (nearest expiration in the ±10-day window, exact strikes); without one it
/// synthesizes well-formed OCC symbols at exactly `today + dte`. Orders are
/// held in memory; tests drive status transitions through [`set_status`].
///
/// [`set_status`]: PaperBroker::set_status
pub struct PaperBroker {
    today: NaiveDate,
    chain_expirations: Vec<NaiveDate>,
    chain_strikes: Vec<f64>,
    orders: Mutex<BTreeMap<String, OrderSnapshot>>,
}

impl PaperBroker {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            chain_expirations: Vec::new(),
            chain_strikes: Vec::new(),
            orders: Mutex::new(BTreeMap::new()),
        }
    }

    /// Constrain resolution to an explicit chain.
    pub fn with_chain(mut self, expirations: Vec<NaiveDate>, strikes: Vec<f64>) -> Self {
        self.chain_expirations = expirations;
        self.chain_strikes = strikes;
        self
    }

    /// Drive an order to a new broker-side status (test/poll harness hook).
    pub fn set_status(&self, id: &str, status: &str) -> Result<(), BrokerError> {
        let mut orders = self.orders.lock().expect("paper broker lock");
        match orders.get_mut(id) {
            Some(o) => {
                o.status = status.to_string();
                Ok(())
            }
            None => Err(BrokerError::UnknownOrder { id: id.to_string() }),
        }
    }

    fn pick_expiration(&self, target: NaiveDate) -> Result<NaiveDate, BrokerError> {
        if self.chain_expirations.is_empty() {
            return Ok(target);
        }
        self.chain_expirations
            .iter()
            .copied()
            .filter(|e| (*e - target).num_days().abs() <= EXPIRATION_WINDOW_DAYS)
            .min_by_key(|e| (*e - target).num_days().abs())
            .ok_or(BrokerError::NoExpirationInWindow)
    }

    fn has_strike(&self, k: f64) -> bool {
        self.chain_strikes.is_empty() || self.chain_strikes.iter().any(|s| (s - k).abs() <= STRIKE_TOL)
    }
}

impl BrokerApi for PaperBroker {
    fn resolve_vertical(&self, spec: &VerticalSpec) -> Result<ResolvedVertical, BrokerError> {
        let target = self.today + Duration::days(spec.dte_days);
        let expiration = self.pick_expiration(target)?;

        if !self.has_strike(spec.k_long) || !self.has_strike(spec.k_short) {
            return Err(BrokerError::LegSymbolNotFound { expiration });
        }

        let long_symbol = OccSymbol::new(&spec.underlier, expiration, spec.is_call, spec.k_long).emit();
        let short_symbol =
            OccSymbol::new(&spec.underlier, expiration, spec.is_call, spec.k_short).emit();

        Ok(ResolvedVertical {
            long_symbol,
            short_symbol,
            expiration,
            dte_days: (expiration - self.today).num_days(),
        })
    }

    fn submit_multileg_limit(
        &self,
        legs: &[OrderLeg],
        qty: i64,
        limit_price: f64,
        tif: TimeInForce,
    ) -> Result<OrderSnapshot, BrokerError> {
        if legs.is_empty() {
            return Err(BrokerError::InvalidOrder {
                detail: "no legs".to_string(),
            });
        }
        if qty <= 0 {
            return Err(BrokerError::InvalidOrder {
                detail: format!("qty={qty}"),
            });
        }
        if !limit_price.is_finite() || limit_price <= 0.0 {
            return Err(BrokerError::InvalidOrder {
                detail: format!("limit_price={limit_price}"),
            });
        }

        let id = Uuid::new_v4().to_string();
        let snap = OrderSnapshot {
            id: id.clone(),
            // Enum-prefixed on purpose: downstream normalization must strip it.
            status: "OrderStatus.ACCEPTED".to_string(),
            raw: json!({
                "legs": legs,
                "qty": qty,
                "limit_price": limit_price,
                "tif": tif,
            }),
        };
        self.orders
            .lock()
            .expect("paper broker lock")
            .insert(id, snap.clone());
        Ok(snap)
    }

    fn get_order(&self, id: &str) -> Result<OrderSnapshot, BrokerError> {
        self.orders
            .lock()
            .expect("paper broker lock")
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownOrder { id: id.to_string() })
    }

    fn list_open_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        Ok(self
            .orders
            .lock()
            .expect("paper broker lock")
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrderSide;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn spec() -> VerticalSpec {
        VerticalSpec {
            underlier: "QQQ".to_string(),
            is_call: true,
            k_long: 600.0,
            k_short: 610.0,
            dte_days: 30,
        }
    }

    #[test]
    fn synthetic_resolution_hits_exact_dte() {
        let b = PaperBroker::new(day(2026, 2, 18));
        let rv = b.resolve_vertical(&spec()).unwrap();
        assert_eq!(rv.expiration, day(2026, 3, 20));
        assert_eq!(rv.dte_days, 30);
        assert_eq!(rv.long_symbol, "QQQ260320C00600000");
        assert_eq!(rv.short_symbol, "QQQ260320C00610000");
    }

    #[test]
    fn chain_resolution_picks_nearest_expiration_in_window() {
        let b = PaperBroker::new(day(2026, 2, 18)).with_chain(
            vec![day(2026, 3, 13), day(2026, 3, 27), day(2026, 6, 19)],
            vec![595.0, 600.0, 605.0, 610.0],
        );
        let rv = b.resolve_vertical(&spec()).unwrap();
        // target 2026-03-20: the 13th and 27th are both 7 days out; min_by_key
        // keeps the earlier on ties.
        assert_eq!(rv.expiration, day(2026, 3, 13));
    }

    #[test]
    fn chain_without_window_expiration_fails() {
        let b = PaperBroker::new(day(2026, 2, 18))
            .with_chain(vec![day(2026, 6, 19)], vec![600.0, 610.0]);
        assert_eq!(
            b.resolve_vertical(&spec()).unwrap_err(),
            BrokerError::NoExpirationInWindow
        );
    }

    #[test]
    fn chain_missing_strike_fails() {
        let b = PaperBroker::new(day(2026, 2, 18))
            .with_chain(vec![day(2026, 3, 20)], vec![600.0, 605.0]);
        assert!(matches!(
            b.resolve_vertical(&spec()).unwrap_err(),
            BrokerError::LegSymbolNotFound { .. }
        ));
    }

    #[test]
    fn submit_tracks_order_and_status_advances() {
        let b = PaperBroker::new(day(2026, 2, 18));
        let legs = vec![
            OrderLeg {
                symbol: "QQQ260320C00600000".to_string(),
                ratio_qty: 1,
                side: OrderSide::Buy,
            },
            OrderLeg {
                symbol: "QQQ260320C00610000".to_string(),
                ratio_qty: 1,
                side: OrderSide::Sell,
            },
        ];
        let snap = b.submit_multileg_limit(&legs, 2, 3.85, TimeInForce::Day).unwrap();
        assert_eq!(snap.status, "OrderStatus.ACCEPTED");

        b.set_status(&snap.id, "OrderStatus.FILLED").unwrap();
        assert_eq!(b.get_order(&snap.id).unwrap().status, "OrderStatus.FILLED");
        assert_eq!(b.list_open_orders().unwrap().len(), 1);
    }

    #[test]
    fn invalid_submits_are_refused() {
        let b = PaperBroker::new(day(2026, 2, 18));
        assert!(b.submit_multileg_limit(&[], 1, 1.0, TimeInForce::Day).is_err());
        let leg = OrderLeg {
            symbol: "QQQ260320C00600000".to_string(),
            ratio_qty: 1,
            side: OrderSide::Buy,
        };
        assert!(b
            .submit_multileg_limit(std::slice::from_ref(&leg), 0, 1.0, TimeInForce::Day)
            .is_err());
        assert!(b
            .submit_multileg_limit(std::slice::from_ref(&leg), 1, 0.0, TimeInForce::Day)
            .is_err());
    }
}
