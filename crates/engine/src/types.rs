//! Opportunity and classification types shared by every engine component.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ──────────────────────────────────────────────
// Action type
// ──────────────────────────────────────────────

/// The kind of storefront change an opportunity proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SeoRewrite,
    CartRecoverySend,
    UpsellActivation,
    PriceAdjustment,
    ContentRefresh,
    ImageAltText,
    CollectionReorder,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::SeoRewrite,
        ActionType::CartRecoverySend,
        ActionType::UpsellActivation,
        ActionType::PriceAdjustment,
        ActionType::ContentRefresh,
        ActionType::ImageAltText,
        ActionType::CollectionReorder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SeoRewrite => "seo_rewrite",
            ActionType::CartRecoverySend => "cart_recovery_send",
            ActionType::UpsellActivation => "upsell_activation",
            ActionType::PriceAdjustment => "price_adjustment",
            ActionType::ContentRefresh => "content_refresh",
            ActionType::ImageAltText => "image_alt_text",
            ActionType::CollectionReorder => "collection_reorder",
        }
    }

    /// The storefront field this action mutates. The connector captures
    /// and restores exactly this field.
    pub fn target_field(&self) -> &'static str {
        match self {
            ActionType::SeoRewrite => "seo",
            ActionType::CartRecoverySend => "cart_recovery",
            ActionType::UpsellActivation => "upsell",
            ActionType::PriceAdjustment => "price",
            ActionType::ContentRefresh => "description",
            ActionType::ImageAltText => "image_alt",
            ActionType::CollectionReorder => "collection_order",
        }
    }

    /// Cart recovery is store-wide; every other action addresses an entity.
    pub fn requires_target(&self) -> bool {
        !matches!(self, ActionType::CartRecoverySend)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────────────────────────────────
// Risk and plan tier
// ──────────────────────────────────────────────

/// Risk of an action, ordered `low < medium < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

/// Subscription level, ordered `starter < growth < pro < enterprise`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Starter,
    Growth,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Starter,
        PlanTier::Growth,
        PlanTier::Pro,
        PlanTier::Enterprise,
    ];
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        })
    }
}

// ──────────────────────────────────────────────
// Opportunity
// ──────────────────────────────────────────────

/// A candidate action produced by the opportunity source.
///
/// Opportunities are immutable once selected; the selected copy is embedded
/// in the next move so later feed updates cannot change what gets executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub action_type: ActionType,
    /// Product, collection or page the action addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub rationale: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub expected_monthly_revenue: Decimal,
    /// Revenue forgone per month if the action is skipped.
    #[serde(default)]
    pub opportunity_cost: Decimal,
    /// 0-100.
    pub confidence: u8,
    pub risk: RiskLevel,
    #[serde(default)]
    pub required_plan: PlanTier,
    pub credit_cost: u32,
    /// Position in the source's ranking; lower is better.
    #[serde(default)]
    pub rank: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// The concrete change, written to the storefront field on execution.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Opportunity {
    /// Check the record is well-formed enough to be selected.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("opportunity id is empty".to_string());
        }
        if self.confidence > 100 {
            return Err(format!(
                "opportunity {}: confidence {} is outside 0-100",
                self.id, self.confidence
            ));
        }
        if self.action_type.requires_target() && self.target.is_none() {
            return Err(format!(
                "opportunity {}: {} requires a target",
                self.id, self.action_type
            ));
        }
        if self.expected_monthly_revenue.is_sign_negative() {
            return Err(format!(
                "opportunity {}: expected revenue is negative",
                self.id
            ));
        }
        Ok(())
    }

    /// Expected monthly revenue per credit, rounded to cents. `None` for
    /// free actions.
    pub fn credit_value_ratio(&self) -> Option<Decimal> {
        if self.credit_cost == 0 {
            return None;
        }
        Some((self.expected_monthly_revenue / Decimal::from(self.credit_cost)).round_dp(2))
    }

    /// Key under which the storefront addresses the action's target.
    pub fn target_key(&self) -> &str {
        self.target.as_deref().unwrap_or("store")
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
