//! Tracked live orders (`open_orders.json`), shared by the OPEN executor and
//! the poller.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use odk_state::{utc_now, StateDir, OPEN_ORDERS};

/// One broker order under observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: String,
    /// Normalized lowercase status token.
    pub status: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub tag: Option<String>,
    /// OPEN dedup signature of the request that produced this order.
    #[serde(default)]
    pub signature: Option<String>,
    /// Last `(status, severity)` pair an alert was emitted for.
    #[serde(default)]
    pub last_alert: Option<(String, String)>,
    #[serde(default)]
    pub raw: Value,
}

/// The `open_orders.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrdersStore {
    pub ts: DateTime<Utc>,
    pub mode: String,
    #[serde(default)]
    pub orders: BTreeMap<String, TrackedOrder>,
}

impl OpenOrdersStore {
    pub fn empty(mode: &str) -> Self {
        Self {
            ts: utc_now(),
            mode: mode.to_string(),
            orders: BTreeMap::new(),
        }
    }

    /// Whether an order with this dedup signature is still alive.
    pub fn has_active_signature(&self, signature: &str) -> bool {
        self.orders
            .values()
            .any(|o| o.signature.as_deref() == Some(signature) && is_active_status(&o.status))
    }
}

/// Statuses that still count as a live order for dedup purposes.
pub fn is_active_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "new" | "accepted" | "pending_new" | "partially_filled" | "held" | "replaced"
    )
}

pub fn load_open_orders(dir: &StateDir, mode: &str) -> Result<OpenOrdersStore> {
    Ok(dir
        .read_json(OPEN_ORDERS)?
        .unwrap_or_else(|| OpenOrdersStore::empty(mode)))
}

pub fn save_open_orders(dir: &StateDir, store: &OpenOrdersStore) -> Result<()> {
    dir.write_json_atomic(OPEN_ORDERS, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        for s in ["new", "accepted", "pending_new", "partially_filled", "held", "replaced"] {
            assert!(is_active_status(s), "{s}");
        }
        for s in ["filled", "canceled", "rejected", "expired", "failed", ""] {
            assert!(!is_active_status(s), "{s}");
        }
    }

    #[test]
    fn signature_lookup_ignores_dead_orders() {
        let mut store = OpenOrdersStore::empty("LIVE");
        store.orders.insert(
            "a".into(),
            TrackedOrder {
                order_id: "a".into(),
                status: "filled".into(),
                last_seen: utc_now(),
                tag: None,
                signature: Some("sig1".into()),
                last_alert: None,
                raw: Value::Null,
            },
        );
        assert!(!store.has_active_signature("sig1"));

        store.orders.get_mut("a").unwrap().status = "accepted".into();
        assert!(store.has_active_signature("sig1"));
    }
}
