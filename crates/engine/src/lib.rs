//! Next-move engine -- picks the single best action for a merchant, gates
//! it on readiness, plan and credits, executes it against the storefront,
//! and keeps it reversible.
//!
//! Components:
//! - [`readiness`]: store readiness gate
//! - [`source`]: opportunity source and merchant directory
//! - [`selector`]: next-move selection
//! - [`authorization`]: authorization gate
//! - [`ledger`]: credit ledger
//! - [`connector`]: storefront connector
//! - [`rollback`]: rollback manager
//! - [`monitor`]: monitoring loop and regression signal
//! - [`engine`]: the facade exposing `get_next_move`, `approve`,
//!   `execute`, `rollback`
//! - [`scheduler`]: periodic per-merchant cycles

pub mod authorization;
pub mod clock;
pub mod config;
pub mod connector;
pub mod engine;
mod error;
mod executor;
pub mod ledger;
pub mod monitor;
pub mod next_move;
mod persist;
pub mod readiness;
#[cfg(feature = "remote")]
pub mod remote;
pub mod rollback;
pub mod scheduler;
pub mod selector;
pub mod source;
pub mod status;
pub mod types;

pub use authorization::{AuthorizationGate, PlanPolicy, Verdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use connector::{ConnectorError, InMemoryStorefront, StorefrontConnector};
pub use engine::{Collaborators, Engine, NextMoveView};
pub use error::EngineError;
pub use ledger::{Balance, CreditLedger, DebitOutcome};
pub use monitor::{NoRegression, Observation, RegressionSignal, SignalBoard};
pub use next_move::NextMove;
pub use readiness::{Readiness, ReadinessGate, StaticReadiness};
pub use rollback::RollbackOutcome;
pub use scheduler::{CycleReport, Scheduler};
pub use source::{
    MerchantDirectory, OpportunitySource, SourceError, StaticDirectory, StaticOpportunitySource,
};
pub use status::{IllegalTransition, NextMoveStatus, RollbackTrigger, Transition};
pub use types::{ActionType, Opportunity, PlanTier, RiskLevel};
