//! Store readiness gate.
//!
//! Readiness is a pure query against the storefront connector's health and
//! is re-checked before every step that could advance a next move. Code
//! that selects or executes takes a [`ReadyStore`], which can only be
//! obtained from [`confirm_ready`] when the gate reports `ready`.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Connection state of a merchant's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    NotConnected,
    WarmingUp,
    Ready,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Readiness::NotConnected => "not_connected",
            Readiness::WarmingUp => "warming_up",
            Readiness::Ready => "ready",
        })
    }
}

/// Source of per-merchant readiness.
///
/// Implementations report `not_connected` when they cannot tell; the engine
/// never advances a move on an unknown store.
#[async_trait]
pub trait ReadinessGate: Send + Sync {
    async fn readiness(&self, merchant_id: &str) -> Readiness;
}

/// Proof that a merchant's store reported `ready` when last checked.
#[derive(Debug)]
pub struct ReadyStore {
    merchant_id: String,
}

impl ReadyStore {
    pub fn merchant_id(&self) -> &str {
        &self.merchant_id
    }

    #[cfg(test)]
    pub(crate) fn assume(merchant_id: &str) -> Self {
        Self {
            merchant_id: merchant_id.to_string(),
        }
    }
}

/// Query the gate and return a [`ReadyStore`] only if the store is ready.
pub async fn confirm_ready(
    gate: &dyn ReadinessGate,
    merchant_id: &str,
) -> Result<ReadyStore, Readiness> {
    match gate.readiness(merchant_id).await {
        Readiness::Ready => Ok(ReadyStore {
            merchant_id: merchant_id.to_string(),
        }),
        other => Err(other),
    }
}

// ──────────────────────────────────────────────
// StaticReadiness
// ──────────────────────────────────────────────

/// Readiness held in memory and updated by whoever observes the connector
/// (the HTTP API, a fixture, a test).
#[derive(Debug)]
pub struct StaticReadiness {
    states: RwLock<HashMap<String, Readiness>>,
    default: Readiness,
}

impl Default for StaticReadiness {
    fn default() -> Self {
        Self::new(Readiness::NotConnected)
    }
}

impl StaticReadiness {
    /// `default` is reported for merchants never set.
    pub fn new(default: Readiness) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            default,
        }
    }

    pub fn set(&self, merchant_id: &str, readiness: Readiness) {
        self.states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(merchant_id.to_string(), readiness);
    }
}

#[async_trait]
impl ReadinessGate for StaticReadiness {
    async fn readiness(&self, merchant_id: &str) -> Readiness {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(merchant_id)
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_merchant_reports_default() {
        let gate = StaticReadiness::default();
        assert_eq!(gate.readiness("m1").await, Readiness::NotConnected);
    }

    #[tokio::test]
    async fn confirm_ready_only_when_ready() {
        let gate = StaticReadiness::default();
        gate.set("m1", Readiness::WarmingUp);
        assert_eq!(
            confirm_ready(&gate, "m1").await.unwrap_err(),
            Readiness::WarmingUp
        );

        gate.set("m1", Readiness::Ready);
        let store = confirm_ready(&gate, "m1").await.unwrap();
        assert_eq!(store.merchant_id(), "m1");
    }

    #[test]
    fn readiness_wire_format() {
        let r: Readiness = serde_json::from_str("\"warming_up\"").unwrap();
        assert_eq!(r, Readiness::WarmingUp);
        assert_eq!(Readiness::NotConnected.to_string(), "not_connected");
    }
}
