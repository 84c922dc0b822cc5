//! Shared fixture: an engine over in-memory storage and collaborators.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use nextmove_engine::{
    ActionType, Collaborators, Engine, EngineConfig, InMemoryStorefront, ManualClock,
    NextMoveView, Opportunity, PlanTier, Readiness, RiskLevel, SignalBoard, StaticDirectory,
    StaticOpportunitySource, StaticReadiness, StorefrontConnector,
};
use nextmove_storage::InMemoryStorage;
use rust_decimal::Decimal;
use time::macros::datetime;

pub struct Harness {
    pub engine: Arc<Engine<InMemoryStorage>>,
    pub storage: Arc<InMemoryStorage>,
    pub source: Arc<StaticOpportunitySource>,
    pub readiness: Arc<StaticReadiness>,
    pub directory: Arc<StaticDirectory>,
    pub storefront: Arc<InMemoryStorefront>,
    pub signals: Arc<SignalBoard>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let storefront = Arc::new(InMemoryStorefront::new());
        Self::build(config, storefront.clone(), storefront)
    }

    /// Use `connector` for execution while keeping the in-memory storefront
    /// around for assertions.
    pub fn build(
        config: EngineConfig,
        storefront: Arc<InMemoryStorefront>,
        connector: Arc<dyn StorefrontConnector>,
    ) -> Self {
        Self::build_on(Arc::new(InMemoryStorage::new()), config, storefront, connector)
    }

    pub fn build_on(
        storage: Arc<InMemoryStorage>,
        config: EngineConfig,
        storefront: Arc<InMemoryStorefront>,
        connector: Arc<dyn StorefrontConnector>,
    ) -> Self {
        let source = Arc::new(StaticOpportunitySource::new());
        let readiness = Arc::new(StaticReadiness::default());
        let directory = Arc::new(StaticDirectory::new());
        let signals = Arc::new(SignalBoard::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-10-01 09:00 UTC)));
        let parts = Collaborators {
            source: source.clone(),
            readiness: readiness.clone(),
            directory: directory.clone(),
            connector,
            signal: signals.clone(),
            clock: clock.clone(),
        };
        let engine = Arc::new(Engine::new(storage.clone(), parts, config));
        Self {
            engine,
            storage,
            source,
            readiness,
            directory,
            storefront,
            signals,
            clock,
        }
    }

    /// Register a merchant with a plan, a ledger and a readiness state.
    pub async fn merchant(&self, id: &str, plan: PlanTier, credits: u32, readiness: Readiness) {
        self.directory.set_plan(id, plan);
        self.readiness.set(id, readiness);
        self.engine.ledger().open(id, credits).await.unwrap();
    }

    pub async fn active(&self, merchant_id: &str) -> nextmove_engine::NextMove {
        match self.engine.get_next_move(merchant_id).await.unwrap() {
            NextMoveView::Active { next_move } => next_move,
            other => panic!("expected an active next move, got {:?}", other),
        }
    }

    pub async fn remaining(&self, merchant_id: &str) -> u32 {
        self.engine.credits(merchant_id).await.unwrap().remaining
    }
}

pub fn opportunity(id: &str, credit_cost: u32, risk: RiskLevel) -> Opportunity {
    Opportunity {
        id: id.to_string(),
        action_type: ActionType::SeoRewrite,
        target: Some("product-42".to_string()),
        rationale: "Title misses the highest-volume search term".to_string(),
        reasons: vec![
            "organic CTR below category median".to_string(),
            "competitor ranks for the term".to_string(),
        ],
        expected_monthly_revenue: Decimal::from_str("900.00").unwrap(),
        opportunity_cost: Decimal::from_str("150.00").unwrap(),
        confidence: 78,
        risk,
        required_plan: PlanTier::Starter,
        credit_cost,
        rank: 1,
        created_at: datetime!(2026-10-01 08:00 UTC),
        payload: serde_json::json!({"title": "Organic Cotton Crew Tee"}),
    }
}
