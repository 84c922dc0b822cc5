//! `nextmove serve` -- HTTP JSON API over the next-move engine.
//!
//! Runs the engine on in-memory storage with a background scheduler. Feeds
//! (opportunities, readiness, plans, regression signals) are pushed through
//! the API unless `storefront.pull` pulls them from the platform.
//!
//! Security:
//! - CORS headers on all responses
//! - Per-IP rate limiting (`server.rate_limit`, `NEXTMOVE_RATE_LIMIT` overrides)
//! - Optional API key authentication via `NEXTMOVE_API_KEY`
//!
//! Endpoints:
//! - GET  /health
//! - GET  /merchants/{id}/next-move
//! - GET  /merchants/{id}/history
//! - GET  /merchants/{id}/credits
//! - POST /merchants/{id}/credits          - open the ledger `{monthly_limit}`
//! - POST /merchants/{id}/credits/reset
//! - PUT  /merchants/{id}/opportunities    - ranked `[Opportunity]`
//! - PUT  /merchants/{id}/readiness        - `{readiness}`
//! - PUT  /merchants/{id}/plan             - `{plan}`
//! - GET  /next-moves/{id}
//! - POST /next-moves/{id}/approve|decline|execute|rollback|observe
//! - POST /next-moves/{id}/signal          - `{observation, reason?}`
//!
//! All responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{middleware as axum_middleware, Json, Router};
use nextmove_engine::remote::{
    HttpOpportunitySource, HttpReadinessGate, HttpStorefront, PlatformClient,
};
use nextmove_engine::{
    Collaborators, Engine, EngineConfig, InMemoryStorefront, OpportunitySource, ReadinessGate,
    Scheduler, SignalBoard, StaticDirectory, StaticOpportunitySource, StaticReadiness,
    StorefrontConnector, SystemClock,
};
use nextmove_storage::InMemoryStorage;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use self::handlers::*;
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, Feeds, RateLimiter};

/// Maximum request body size: 2 MB.
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Rate limit window duration in seconds (1 minute).
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Wire the engine to its collaborators as configured.
fn build_state(config: EngineConfig, rate_limit: u64, api_key: Option<String>) -> AppState {
    let directory = Arc::new(StaticDirectory::new());
    let signals = Arc::new(SignalBoard::new());

    let client = config
        .storefront
        .base_url
        .as_deref()
        .map(|url| PlatformClient::new(url, None));
    let connector: Arc<dyn StorefrontConnector> = match &client {
        Some(client) => Arc::new(HttpStorefront::new(client.clone())),
        None => Arc::new(InMemoryStorefront::new()),
    };

    let (source, readiness, feeds) = match &client {
        Some(client) if config.storefront.pull => {
            let source: Arc<dyn OpportunitySource> =
                Arc::new(HttpOpportunitySource::new(client.clone()));
            let readiness: Arc<dyn ReadinessGate> =
                Arc::new(HttpReadinessGate::new(client.clone()));
            let feeds = Feeds {
                source: None,
                readiness: None,
                directory: directory.clone(),
                signals: signals.clone(),
            };
            (source, readiness, feeds)
        }
        _ => {
            let pushed_source = Arc::new(StaticOpportunitySource::new());
            let pushed_readiness = Arc::new(StaticReadiness::default());
            let source: Arc<dyn OpportunitySource> = pushed_source.clone();
            let readiness: Arc<dyn ReadinessGate> = pushed_readiness.clone();
            let feeds = Feeds {
                source: Some(pushed_source),
                readiness: Some(pushed_readiness),
                directory: directory.clone(),
                signals: signals.clone(),
            };
            (source, readiness, feeds)
        }
    };

    let parts = Collaborators {
        source,
        readiness,
        directory,
        connector,
        signal: signals,
        clock: Arc::new(SystemClock),
    };
    AppState {
        engine: Arc::new(Engine::new(Arc::new(InMemoryStorage::new()), parts, config)),
        feeds,
        rate_limiter: RateLimiter::new(rate_limit),
        api_key,
    }
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/merchants/{id}/next-move", get(handle_get_next_move))
        .route("/merchants/{id}/history", get(handle_history))
        .route(
            "/merchants/{id}/credits",
            get(handle_get_credits).post(handle_open_credits),
        )
        .route("/merchants/{id}/credits/reset", post(handle_reset_credits))
        .route("/merchants/{id}/opportunities", put(handle_put_opportunities))
        .route("/merchants/{id}/readiness", put(handle_put_readiness))
        .route("/merchants/{id}/plan", put(handle_put_plan))
        .route("/next-moves/{id}", get(handle_get_next_move_by_id))
        .route("/next-moves/{id}/approve", post(handle_approve))
        .route("/next-moves/{id}/decline", post(handle_decline))
        .route("/next-moves/{id}/execute", post(handle_execute))
        .route("/next-moves/{id}/rollback", post(handle_rollback))
        .route("/next-moves/{id}/signal", post(handle_signal))
        .route("/next-moves/{id}/observe", post(handle_observe))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve the API on `config.server.port` and run the scheduler every
/// `config.scheduler.interval_secs` until Ctrl+C.
pub async fn start_server(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rate_limit = std::env::var("NEXTMOVE_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(config.server.rate_limit);
    let api_key = std::env::var("NEXTMOVE_API_KEY")
        .ok()
        .filter(|k| !k.is_empty());
    if api_key.is_some() {
        info!("API key authentication enabled");
    }
    info!(rate_limit, "per-IP rate limit (requests per minute)");

    let port = config.server.port;
    let interval = config.scheduler_interval();
    let state = Arc::new(build_state(config, rate_limit, api_key));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(state.engine.clone());
    let scheduler_task = tokio::spawn(scheduler.run(interval, shutdown_rx));

    let app = router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "next-move engine listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => {
            warn!(error = %e, "could not listen for Ctrl+C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
