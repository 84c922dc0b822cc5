//! Route handlers: merchant queries and feeds, next-move operations.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nextmove_engine::{EngineError, Observation, Opportunity, PlanTier, Readiness};
use nextmove_storage::StorageError;
use serde::Deserialize;
use tracing::{info, warn};

use super::json_error;
use super::state::AppState;

/// Map an engine error to a status code and JSON body.
fn engine_error(err: EngineError) -> Response {
    match &err {
        EngineError::NotFound(_) | EngineError::UnknownMerchant(_) => {
            json_error(StatusCode::NOT_FOUND, &err.to_string()).into_response()
        }
        EngineError::IllegalTransition(_) | EngineError::Conflict(_) => {
            json_error(StatusCode::CONFLICT, &err.to_string()).into_response()
        }
        EngineError::ExecutionFailed {
            retryable,
            next_move,
            ..
        } => {
            let body = serde_json::json!({
                "error": err.to_string(),
                "retryable": retryable,
                "next_move": next_move,
            });
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
        EngineError::RollbackFailed { cause, .. } => {
            let body = serde_json::json!({
                "error": err.to_string(),
                "retryable": cause.is_retryable(),
            });
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
        EngineError::Source(_) => {
            json_error(StatusCode::BAD_GATEWAY, &err.to_string()).into_response()
        }
        EngineError::Storage(StorageError::LedgerNotFound { .. }) => {
            json_error(StatusCode::NOT_FOUND, &err.to_string()).into_response()
        }
        EngineError::Storage(StorageError::AlreadyInitialized { .. }) => {
            json_error(StatusCode::CONFLICT, &err.to_string()).into_response()
        }
        EngineError::Storage(e) if e.is_conflict() => {
            json_error(StatusCode::CONFLICT, &err.to_string()).into_response()
        }
        _ => {
            warn!(error = %err, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()).into_response()
        }
    }
}

fn ok<T: serde::Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

fn respond<T: serde::Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => engine_error(e),
    }
}

pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

// ── Merchants ────────────────────────────────────────────────────────────

/// GET /merchants/{id}/next-move
pub(crate) async fn handle_get_next_move(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
) -> Response {
    respond(state.engine.get_next_move(&merchant_id).await)
}

/// GET /merchants/{id}/history
pub(crate) async fn handle_history(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
) -> Response {
    match state.engine.history(&merchant_id).await {
        Ok(next_moves) => ok(serde_json::json!({
            "merchant_id": merchant_id,
            "next_moves": next_moves,
        })),
        Err(e) => engine_error(e),
    }
}

/// GET /merchants/{id}/credits
pub(crate) async fn handle_get_credits(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
) -> Response {
    respond(state.engine.credits(&merchant_id).await)
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenLedger {
    monthly_limit: u32,
}

/// POST /merchants/{id}/credits
pub(crate) async fn handle_open_credits(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
    Json(body): Json<OpenLedger>,
) -> Response {
    match state
        .engine
        .ledger()
        .open(&merchant_id, body.monthly_limit)
        .await
    {
        Ok(balance) => (StatusCode::CREATED, Json(balance)).into_response(),
        Err(e) => engine_error(e),
    }
}

/// POST /merchants/{id}/credits/reset
pub(crate) async fn handle_reset_credits(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
) -> Response {
    respond(state.engine.ledger().reset(&merchant_id).await)
}

/// PUT /merchants/{id}/opportunities
pub(crate) async fn handle_put_opportunities(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
    Json(opportunities): Json<Vec<Opportunity>>,
) -> Response {
    let Some(source) = &state.feeds.source else {
        return json_error(
            StatusCode::CONFLICT,
            "opportunities are pulled from the storefront platform",
        )
        .into_response();
    };
    let count = opportunities.len();
    source.replace(&merchant_id, opportunities);
    info!(merchant_id = %merchant_id, count, "opportunity feed replaced");
    ok(serde_json::json!({ "merchant_id": merchant_id, "opportunities": count }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SetReadiness {
    readiness: Readiness,
}

/// PUT /merchants/{id}/readiness
pub(crate) async fn handle_put_readiness(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
    Json(body): Json<SetReadiness>,
) -> Response {
    let Some(gate) = &state.feeds.readiness else {
        return json_error(
            StatusCode::CONFLICT,
            "readiness is pulled from the storefront platform",
        )
        .into_response();
    };
    gate.set(&merchant_id, body.readiness);
    info!(merchant_id = %merchant_id, readiness = %body.readiness, "readiness updated");
    ok(serde_json::json!({ "merchant_id": merchant_id, "readiness": body.readiness }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SetPlan {
    plan: PlanTier,
}

/// PUT /merchants/{id}/plan
pub(crate) async fn handle_put_plan(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
    Json(body): Json<SetPlan>,
) -> Response {
    state.feeds.directory.set_plan(&merchant_id, body.plan);
    info!(merchant_id = %merchant_id, plan = %body.plan, "plan updated");
    ok(serde_json::json!({ "merchant_id": merchant_id, "plan": body.plan }))
}

// ── Next moves ───────────────────────────────────────────────────────────

/// GET /next-moves/{id}
pub(crate) async fn handle_get_next_move_by_id(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
) -> Response {
    respond(state.engine.next_move(&next_move_id).await)
}

/// POST /next-moves/{id}/approve
pub(crate) async fn handle_approve(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
) -> Response {
    respond(state.engine.approve(&next_move_id).await)
}

/// POST /next-moves/{id}/decline
pub(crate) async fn handle_decline(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
) -> Response {
    respond(state.engine.decline(&next_move_id).await)
}

/// POST /next-moves/{id}/execute
pub(crate) async fn handle_execute(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
) -> Response {
    respond(state.engine.execute(&next_move_id).await)
}

/// POST /next-moves/{id}/rollback
pub(crate) async fn handle_rollback(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
) -> Response {
    respond(state.engine.rollback(&next_move_id).await)
}

/// POST /next-moves/{id}/signal
///
/// Record what analytics observed for an executed move; the next
/// monitoring step acts on it. Terminal moves are refused.
pub(crate) async fn handle_signal(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
    Json(observation): Json<Observation>,
) -> Response {
    let next_move = match state.engine.next_move(&next_move_id).await {
        Ok(next_move) => next_move,
        Err(e) => return engine_error(e),
    };
    if next_move.status.is_terminal() {
        let message = format!(
            "next move {} is {}; signals are only recorded while it is active",
            next_move_id,
            next_move.status.name()
        );
        return json_error(StatusCode::CONFLICT, &message).into_response();
    }
    state.feeds.signals.report(&next_move_id, observation.clone());
    info!(next_move_id = %next_move_id, ?observation, "regression signal recorded");
    ok(serde_json::json!({ "next_move_id": next_move_id, "signal": observation }))
}

/// POST /next-moves/{id}/observe
pub(crate) async fn handle_observe(
    State(state): State<Arc<AppState>>,
    Path(next_move_id): Path<String>,
) -> Response {
    respond(state.engine.observe(&next_move_id).await)
}
