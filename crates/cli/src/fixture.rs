//! `nextmove cycle` fixtures: merchants, feeds and storefront state loaded
//! from JSON, run through the scheduler against in-memory collaborators.
//!
//! ```json
//! {
//!   "start": "2026-10-01T09:00:00Z",
//!   "cycles": 2,
//!   "advance_secs": 259200,
//!   "merchants": [
//!     {
//!       "id": "m1", "plan": "pro", "credits": 100, "readiness": "ready",
//!       "fields": [{"target": "product-42", "field": "seo", "value": {"title": "Tee"}}],
//!       "opportunities": [ ... ]
//!     }
//!   ]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use nextmove_engine::{
    Collaborators, CycleReport, Engine, EngineConfig, InMemoryStorefront, ManualClock,
    NextMoveView, NoRegression, Opportunity, PlanTier, Readiness, Scheduler, StaticDirectory,
    StaticOpportunitySource, StaticReadiness,
};
use nextmove_storage::InMemoryStorage;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Fixture {
    /// Clock start; defaults to the current time.
    #[serde(default, with = "time::serde::rfc3339::option")]
    start: Option<OffsetDateTime>,
    #[serde(default = "one")]
    cycles: u32,
    /// Clock advance between cycles.
    #[serde(default)]
    advance_secs: u64,
    merchants: Vec<FixtureMerchant>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureMerchant {
    id: String,
    #[serde(default)]
    plan: PlanTier,
    credits: u32,
    readiness: Readiness,
    #[serde(default)]
    opportunities: Vec<Opportunity>,
    #[serde(default)]
    fields: Vec<FixtureField>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureField {
    target: String,
    field: String,
    value: serde_json::Value,
}

fn one() -> u32 {
    1
}

impl Fixture {
    pub(crate) fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
        let fixture: Fixture = serde_json::from_str(&content)
            .map_err(|e| format!("invalid fixture '{}': {}", path.display(), e))?;
        if fixture.cycles == 0 {
            return Err("fixture must run at least one cycle".to_string());
        }
        Ok(fixture)
    }

    /// Run the configured number of cycles; returns the reports of the last.
    pub(crate) async fn run(self, config: EngineConfig) -> Result<Vec<CycleReport>, String> {
        let clock = Arc::new(ManualClock::new(
            self.start.unwrap_or_else(OffsetDateTime::now_utc),
        ));
        let source = Arc::new(StaticOpportunitySource::new());
        let readiness = Arc::new(StaticReadiness::default());
        let directory = Arc::new(StaticDirectory::new());
        let storefront = Arc::new(InMemoryStorefront::new());
        let parts = Collaborators {
            source: source.clone(),
            readiness: readiness.clone(),
            directory: directory.clone(),
            connector: storefront.clone(),
            signal: Arc::new(NoRegression),
            clock: clock.clone(),
        };
        let engine = Arc::new(Engine::new(Arc::new(InMemoryStorage::new()), parts, config));

        for merchant in self.merchants {
            directory.set_plan(&merchant.id, merchant.plan);
            readiness.set(&merchant.id, merchant.readiness);
            source.replace(&merchant.id, merchant.opportunities);
            for f in merchant.fields {
                storefront.set_field(&merchant.id, &f.target, &f.field, f.value);
            }
            engine
                .ledger()
                .open(&merchant.id, merchant.credits)
                .await
                .map_err(|e| e.to_string())?;
        }

        let scheduler = Scheduler::new(engine);
        let mut reports = scheduler.run_all().await;
        for _ in 1..self.cycles {
            clock.advance(Duration::seconds(self.advance_secs as i64));
            reports = scheduler.run_all().await;
        }
        Ok(reports)
    }
}

/// One line per merchant for text output.
pub(crate) fn summarize(report: &CycleReport) -> String {
    let mut line = match &report.view {
        NextMoveView::StoreNotReady { readiness } => {
            format!("{}: store not ready ({})", report.merchant_id, readiness)
        }
        NextMoveView::NoAction => format!("{}: no action", report.merchant_id),
        NextMoveView::Active { next_move } => format!(
            "{}: {} {} {} on {} ({} credits)",
            report.merchant_id,
            next_move.id,
            next_move.status,
            next_move.opportunity.action_type,
            next_move.opportunity.target_key(),
            next_move.opportunity.credit_cost
        ),
    };
    if let Some(err) = &report.execution_error {
        line.push_str(&format!(" [execution error: {}]", err));
    }
    line
}
