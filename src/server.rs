// ── HTTP Surface ───────────────────────────────────────────────────────────
// Thin axum layer over the dispatch engine. Four routes:
//
//   POST /v1/chat/completions   dispatch a chat completion
//   GET  /v1/models             public model catalogue
//   GET  /v1/providers/stats    per-model, per-instance health snapshot
//   GET  /health                liveness probe
//
// Dispatches run in a spawned task so a client disconnect cannot cancel
// post-flight accounting mid-commit; the in-flight gauge feeds the bounded
// drain on shutdown.

use crate::atoms::error::GatewayError;
use crate::atoms::types::ChatRequest;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::metrics::GlobalCounters;
use crate::engine::registry::ModelRegistry;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::error;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

// ── Shared state ───────────────────────────────────────────────────────────

pub struct Gateway {
    pub registry: Arc<ModelRegistry>,
    pub dispatcher: Dispatcher,
    pub counters: Arc<GlobalCounters>,
    /// Requests currently inside the dispatcher, for shutdown draining.
    pub in_flight: AtomicU64,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/providers/stats", get(provider_stats))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

// ── Error mapping ──────────────────────────────────────────────────────────

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": kind,
            }
        })),
    )
        .into_response()
}

fn map_dispatch_error(error: GatewayError) -> Response {
    match error {
        GatewayError::UnknownModel(model) => error_response(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            format!("model `{model}` is not configured"),
        ),
        GatewayError::NoCapacity(detail) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", detail)
        }
        other => {
            error!("[server] unexpected dispatch error: {other}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error".into(),
            )
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                rejection.body_text(),
            )
        }
    };

    // Detached task: if the client hangs up, the attempt still finishes and
    // commits whatever usage the upstream reported.
    let worker = gateway.clone();
    let handle = tokio::spawn(async move {
        worker.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = worker.dispatcher.dispatch(&request).await;
        worker.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    });

    match handle.await {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(error)) => map_dispatch_error(error),
        Err(join_error) => {
            error!("[server] dispatch task failed: {join_error}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error".into(),
            )
        }
    }
}

async fn list_models(State(gateway): State<Arc<Gateway>>) -> Response {
    let data: Vec<_> = gateway
        .registry
        .models()
        .iter()
        .map(|(id, entry)| {
            json!({
                "id": id,
                "object": "model",
                "created": entry.created,
                "owned_by": entry.owned_by,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn provider_stats(State(gateway): State<Arc<Gateway>>) -> Response {
    let counters = &gateway.counters;
    Json(json!({
        "totals": {
            "requests": counters.requests.load(Ordering::Relaxed),
            "errors": counters.errors.load(Ordering::Relaxed),
            "prompt_tokens": counters.prompt_tokens.load(Ordering::Relaxed),
            "completion_tokens": counters.completion_tokens.load(Ordering::Relaxed),
            "credits": counters.credits_spent(),
        },
        "models": gateway.registry.stats(),
    }))
    .into_response()
}

async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}
