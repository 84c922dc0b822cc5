//! Opportunity source and merchant directory.
//!
//! Both are collaborators the engine consumes but does not own: the source
//! ranks candidate actions each cycle, the directory knows which merchants
//! exist and what plan they are on.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::types::{Opportunity, PlanTier};

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Errors that can occur when fetching opportunities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// A provider-specific error occurred.
    #[error("opportunity source error: {0}")]
    Provider(String),
}

// ──────────────────────────────────────────────
// Traits
// ──────────────────────────────────────────────

/// Supplies the current ranked opportunities for a merchant.
///
/// The ranking belongs to the source; the selector only takes the top
/// element.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn opportunities(&self, merchant_id: &str) -> Result<Vec<Opportunity>, SourceError>;
}

/// Knows every merchant and its plan tier.
#[async_trait]
pub trait MerchantDirectory: Send + Sync {
    /// `None` for merchants the directory does not know.
    async fn plan_tier(&self, merchant_id: &str) -> Option<PlanTier>;

    /// Merchants the scheduler should cycle over.
    async fn merchants(&self) -> Vec<String>;
}

// ──────────────────────────────────────────────
// StaticOpportunitySource
// ──────────────────────────────────────────────

/// An opportunity feed held in memory, replaced wholesale per merchant.
#[derive(Debug, Default)]
pub struct StaticOpportunitySource {
    feeds: RwLock<HashMap<String, Vec<Opportunity>>>,
}

impl StaticOpportunitySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a merchant's feed with a new ranked list.
    pub fn replace(&self, merchant_id: &str, opportunities: Vec<Opportunity>) {
        self.feeds
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(merchant_id.to_string(), opportunities);
    }
}

#[async_trait]
impl OpportunitySource for StaticOpportunitySource {
    async fn opportunities(&self, merchant_id: &str) -> Result<Vec<Opportunity>, SourceError> {
        Ok(self
            .feeds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(merchant_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ──────────────────────────────────────────────
// StaticDirectory
// ──────────────────────────────────────────────

/// Merchant plans held in memory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    plans: RwLock<BTreeMap<String, PlanTier>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plan(&self, merchant_id: &str, plan: PlanTier) {
        self.plans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(merchant_id.to_string(), plan);
    }
}

#[async_trait]
impl MerchantDirectory for StaticDirectory {
    async fn plan_tier(&self, merchant_id: &str) -> Option<PlanTier> {
        self.plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(merchant_id)
            .copied()
    }

    async fn merchants(&self) -> Vec<String> {
        self.plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::opportunity;

    #[tokio::test]
    async fn static_source_returns_feed() {
        let source = StaticOpportunitySource::new();
        source.replace("m1", vec![opportunity("o1"), opportunity("o2")]);

        let feed = source.opportunities("m1").await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].id, "o1");
    }

    #[tokio::test]
    async fn unknown_merchant_has_empty_feed() {
        let source = StaticOpportunitySource::new();
        assert!(source.opportunities("m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_lists_merchants_sorted() {
        let directory = StaticDirectory::new();
        directory.set_plan("m2", PlanTier::Pro);
        directory.set_plan("m1", PlanTier::Starter);

        assert_eq!(directory.merchants().await, vec!["m1", "m2"]);
        assert_eq!(directory.plan_tier("m2").await, Some(PlanTier::Pro));
        assert_eq!(directory.plan_tier("m3").await, None);
    }

    #[test]
    fn error_display() {
        let err = SourceError::Provider("connection refused".to_string());
        assert_eq!(err.to_string(), "opportunity source error: connection refused");
    }
}
