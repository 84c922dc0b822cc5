//! Storefront connector: the one place external state is read and mutated.
//!
//! The executor calls `capture` before anything is charged, so a rollback
//! snapshot can always be built; `apply` performs the single mutating call
//! for the action; `revert` writes the captured state back.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::Opportunity;

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// The platform refused the change. Retrying the same change will not help.
    #[error("storefront rejected the change: {0}")]
    Rejected(String),

    /// The platform could not be reached or failed transiently.
    #[error("storefront unavailable: {0}")]
    Unavailable(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Unavailable(_))
    }
}

// ──────────────────────────────────────────────
// Trait
// ──────────────────────────────────────────────

#[async_trait]
pub trait StorefrontConnector: Send + Sync {
    /// Read the state `apply` is about to change.
    async fn capture(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
    ) -> Result<Value, ConnectorError>;

    /// Perform the action. Returns a platform receipt.
    async fn apply(&self, merchant_id: &str, opportunity: &Opportunity)
        -> Result<Value, ConnectorError>;

    /// Restore `prior_state` as returned by `capture`.
    async fn revert(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
        prior_state: &Value,
    ) -> Result<(), ConnectorError>;
}

// ──────────────────────────────────────────────
// InMemoryStorefront
// ──────────────────────────────────────────────

type FieldKey = (String, String, String);

#[derive(Debug, Default)]
struct StorefrontState {
    /// (merchant, target, field) -> value
    fields: BTreeMap<FieldKey, Value>,
    apply_failures: VecDeque<ConnectorError>,
    revert_failures: VecDeque<ConnectorError>,
    applies: usize,
    reverts: usize,
}

/// A simulated storefront: each action writes its payload into one field of
/// its target. Failures can be queued to exercise the error paths.
#[derive(Debug, Default)]
pub struct InMemoryStorefront {
    state: Mutex<StorefrontState>,
}

impl InMemoryStorefront {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StorefrontState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(merchant_id: &str, opportunity: &Opportunity) -> FieldKey {
        (
            merchant_id.to_string(),
            opportunity.target_key().to_string(),
            opportunity.action_type.target_field().to_string(),
        )
    }

    /// Seed a field's current value.
    pub fn set_field(&self, merchant_id: &str, target: &str, field: &str, value: Value) {
        self.lock().fields.insert(
            (merchant_id.to_string(), target.to_string(), field.to_string()),
            value,
        );
    }

    pub fn field(&self, merchant_id: &str, target: &str, field: &str) -> Option<Value> {
        self.lock()
            .fields
            .get(&(merchant_id.to_string(), target.to_string(), field.to_string()))
            .cloned()
    }

    /// Make the next `apply` fail with `error`.
    pub fn fail_next_apply(&self, error: ConnectorError) {
        self.lock().apply_failures.push_back(error);
    }

    /// Make the next `revert` fail with `error`.
    pub fn fail_next_revert(&self, error: ConnectorError) {
        self.lock().revert_failures.push_back(error);
    }

    /// Successful `apply` calls so far.
    pub fn apply_count(&self) -> usize {
        self.lock().applies
    }

    /// Successful `revert` calls so far.
    pub fn revert_count(&self) -> usize {
        self.lock().reverts
    }
}

#[async_trait]
impl StorefrontConnector for InMemoryStorefront {
    async fn capture(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
    ) -> Result<Value, ConnectorError> {
        let key = Self::key(merchant_id, opportunity);
        let current = self.lock().fields.get(&key).cloned();
        Ok(json!({
            "target": key.1,
            "field": key.2,
            "value": current.unwrap_or(Value::Null),
        }))
    }

    async fn apply(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
    ) -> Result<Value, ConnectorError> {
        let mut state = self.lock();
        if let Some(error) = state.apply_failures.pop_front() {
            return Err(error);
        }
        let key = Self::key(merchant_id, opportunity);
        state.fields.insert(key.clone(), opportunity.payload.clone());
        state.applies += 1;
        Ok(json!({
            "target": key.1,
            "field": key.2,
            "value": opportunity.payload,
        }))
    }

    async fn revert(
        &self,
        merchant_id: &str,
        opportunity: &Opportunity,
        prior_state: &Value,
    ) -> Result<(), ConnectorError> {
        let mut state = self.lock();
        if let Some(error) = state.revert_failures.pop_front() {
            return Err(error);
        }
        let key = Self::key(merchant_id, opportunity);
        match prior_state.get("value") {
            Some(Value::Null) | None => {
                state.fields.remove(&key);
            }
            Some(value) => {
                state.fields.insert(key, value.clone());
            }
        }
        state.reverts += 1;
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
