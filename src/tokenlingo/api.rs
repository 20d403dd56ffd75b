//! HTTP boundary (feature `api-server`).
//!
//! | Route | Operation |
//! |---|---|
//! | `POST /api/start` | [`SessionOrchestrator::start`] |
//! | `POST /api/send-message` | [`SessionOrchestrator::send_next_message`] |
//! | `POST /api/stop` | [`SessionOrchestrator::stop`] |
//! | `GET /api/session-status?sessionId=` | [`SessionOrchestrator::status`] |
//! | `POST /api/provider-test/{provider}` | credential heuristics only; no vendor call |
//!
//! Failures answer `{"error", "reason", "detail"?}`. `reason` is
//! [`SessionError::reason_code`]; `detail` carries the underlying cause and is left out when
//! the orchestrator runs with `production` set. `send-message` answers 400 only for a missing
//! `sessionId` and 500 for every orchestrator fault; the other routes also use 404 and 409.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokenlingo::api;
//! use tokenlingo::orchestrator::SessionOrchestrator;
//! use tokenlingo::provider::ProviderRegistry;
//! use tokenlingo::store::JsonlSessionStore;
//! use tokenlingo::OrchestratorConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tokenlingo::init_logger();
//!     let config = OrchestratorConfig::default();
//!     let store = Arc::new(JsonlSessionStore::from_config(&config)?);
//!     let orchestrator = Arc::new(SessionOrchestrator::new(ProviderRegistry::from_env(), store, config));
//!     api::serve("127.0.0.1:8080".parse()?, orchestrator).await?;
//!     Ok(())
//! }
//! ```

use crate::tokenlingo::error::SessionError;
use crate::tokenlingo::orchestrator::{SessionOrchestrator, StartRequest};
use crate::tokenlingo::provider::ProviderKind;
use crate::tokenlingo::session::StopReason;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

type AppState = Arc<SessionOrchestrator>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    context_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    #[serde(default)]
    session_id: Option<String>,
}

pub fn router(orchestrator: Arc<SessionOrchestrator>) -> Router {
    Router::new()
        .route("/api/start", post(start))
        .route("/api/send-message", post(send_message))
        .route("/api/stop", post(stop))
        .route("/api/session-status", get(session_status))
        .route("/api/provider-test/{provider}", post(provider_test))
        .with_state(orchestrator)
}

/// Bind `addr` and serve [`router`] until the task is dropped.
pub async fn serve(addr: SocketAddr, orchestrator: Arc<SessionOrchestrator>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("tokenlingo::api::serve(...): listening on {}", listener.local_addr()?);
    axum::serve(listener, router(orchestrator)).await
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into(), "reason": "validation"})),
    )
        .into_response()
}

fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Validation(_) | SessionError::ProviderUnavailable(_) => StatusCode::BAD_REQUEST,
        SessionError::SessionNotFound(_) | SessionError::NoSession => StatusCode::NOT_FOUND,
        SessionError::AlreadyProcessing => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &SessionError, production: bool) -> Response {
    error_response_with(status_for(err), err, production)
}

fn error_response_with(status: StatusCode, err: &SessionError, production: bool) -> Response {
    let mut body = json!({
        "error": err.to_string(),
        "reason": err.reason_code(),
    });
    if !production {
        if let Some(cause) = err.source() {
            body["detail"] = json!(cause.to_string());
        }
    }
    (status, Json(body)).into_response()
}

fn required_id(id: Option<String>) -> Option<String> {
    id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

async fn start(
    State(orchestrator): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match orchestrator.start(request).await {
        Ok(started) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": started.session.id,
                "status": started.session.status,
                "config": {
                    "topic": started.session.config.topic,
                    "scenario": started.session.config.scenario,
                    "maxIterations": started.session.config.max_iterations,
                    "instruction": started.session.config.instruction,
                },
                "participants": started.session.config.participants,
                "estimatedCost": started.estimated_cost,
            })),
        )
            .into_response(),
        Err(err) => error_response(&err, orchestrator.config().production),
    }
}

async fn send_message(
    State(orchestrator): State<AppState>,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(session_id) = required_id(body.session_id) else {
        return bad_request("sessionId is required");
    };
    match orchestrator
        .send_next_message(&session_id, body.context_window)
        .await
    {
        Ok(message) => (StatusCode::OK, Json(json!({ "message": message }))).into_response(),
        // Every turn fault is a 500; clients branch on `reason`.
        Err(err) => error_response_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            &err,
            orchestrator.config().production,
        ),
    }
}

async fn stop(
    State(orchestrator): State<AppState>,
    body: Result<Json<StopBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(session_id) = required_id(body.session_id) else {
        return bad_request("sessionId is required");
    };
    let reason = match body.reason.as_deref().map(str::parse::<StopReason>) {
        None => StopReason::Manual,
        Some(Ok(reason)) => reason,
        Some(Err(other)) => return bad_request(format!("unknown stop reason '{}'", other)),
    };
    match orchestrator.stop(&session_id, reason).await {
        Ok(outcome) => {
            let confirmation = if outcome.already_terminal {
                format!("Session {} was already {}", outcome.session_id, outcome.status)
            } else {
                format!("Session {} {}", outcome.session_id, outcome.status)
            };
            (
                StatusCode::OK,
                Json(json!({
                    "confirmation": confirmation,
                    "sessionId": outcome.session_id,
                    "status": outcome.status,
                    "alreadyTerminal": outcome.already_terminal,
                })),
            )
                .into_response()
        }
        Err(err) => error_response(&err, orchestrator.config().production),
    }
}

async fn session_status(
    State(orchestrator): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(session_id) = required_id(query.session_id) else {
        return bad_request("sessionId is required");
    };
    match orchestrator.status(&session_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => error_response(&err, orchestrator.config().production),
    }
}

async fn provider_test(
    State(orchestrator): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    let kind = match provider.parse::<ProviderKind>() {
        Ok(kind) => kind,
        Err(tag) => return bad_request(format!("unknown provider '{}'", tag)),
    };
    let check = orchestrator.registry().check_credential(kind);
    (
        StatusCode::OK,
        Json(json!({
            "provider": kind.tag(),
            "valid": check.is_valid(),
            "configured": orchestrator.registry().is_available(kind),
            "check": check,
        })),
    )
        .into_response()
}
