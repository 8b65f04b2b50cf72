//! Client-facing HTTP server.
//!
//! Routes: the OpenAI-compatible inference path, a models listing, gateway
//! health, an operator snapshot of the registry, and the worker relay
//! WebSocket endpoint.

pub mod auth;
pub mod types;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::GatewayError;
use crate::registry::{NodeRegistry, NodeStatus};
use crate::relay::{self, WorkerRelay, RELAY_PATH};
use crate::router::RetryCoordinator;
use crate::types::{estimate_tokens, ChatMessage, CompletionRequest};

use auth::{ClientAuth, Tier};
use types::*;

/// Shared state for all gateway handlers.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<NodeRegistry>,
    pub relay: Arc<WorkerRelay>,
    pub coordinator: Arc<RetryCoordinator>,
    pub auth: ClientAuth,
    pub started_at: Instant,
}

/// Build the gateway router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let relay_routes = Router::new()
        .route(RELAY_PATH, any(relay::ws_handler))
        .with_state(Arc::clone(&state.relay));

    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/api/nodes", get(nodes_handler))
        .with_state(state)
        .merge(relay_routes)
        .layer(TraceLayer::new_for_http())
}

/// Validate a client body into a routable request. Pure in the body, the
/// gateway config, and the caller's tier.
pub fn validate_request(
    body: ChatCompletionBody,
    config: &Config,
    tier: Tier,
) -> Result<CompletionRequest, GatewayError> {
    let model = body
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| config.default_model.clone());

    if tier == Tier::Free && config.pro_only_models.iter().any(|m| m == &model) {
        return Err(GatewayError::Tier {
            reason: format!("model '{model}' requires the pro tier"),
        });
    }

    let prompt = body.prompt.filter(|p| !p.is_empty());
    if body.messages.is_empty() && prompt.is_none() {
        return Err(GatewayError::Validation {
            reason: "either messages or prompt is required".to_string(),
        });
    }
    if body.messages.iter().any(|m| m.role.is_empty()) {
        return Err(GatewayError::Validation {
            reason: "message role must not be empty".to_string(),
        });
    }
    if let Some(t) = body.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(GatewayError::Validation {
                reason: "temperature must be between 0 and 2".to_string(),
            });
        }
    }
    if let Some(p) = body.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(GatewayError::Validation {
                reason: "top_p must be between 0 and 1".to_string(),
            });
        }
    }
    if body.max_tokens == Some(0) {
        return Err(GatewayError::Validation {
            reason: "max_tokens must be positive".to_string(),
        });
    }
    let cap = match tier {
        Tier::Free => config.tiers.free_max_tokens,
        Tier::Pro => config.tiers.pro_max_tokens,
    };
    // Free-tier requests without an explicit max_tokens still get the cap;
    // pro requests keep the node's default.
    let max_tokens = match (body.max_tokens, tier) {
        (Some(m), _) => Some(m.min(cap)),
        (None, Tier::Free) => Some(cap),
        (None, Tier::Pro) => None,
    };

    Ok(CompletionRequest {
        model,
        messages: body.messages,
        prompt,
        max_tokens,
        temperature: body.temperature,
        top_p: body.top_p,
    })
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, GatewayError> {
    let (tier, token) = state.auth.authorize(&headers)?;
    state.auth.check_rate(tier, &token).await?;
    tracing::debug!(tier = tier.as_str(), "Request authorized");

    let stream = body.stream;
    let request = validate_request(body, &state.config, tier)?;

    if stream {
        stream_completion(state, request).await
    } else {
        unary_completion(state, request).await
    }
}

async fn unary_completion(
    state: Arc<AppState>,
    request: CompletionRequest,
) -> Result<Response, GatewayError> {
    let prompt_tokens = estimate_tokens(request.input_text_len());
    let model = request.model.clone();
    let completed = state.coordinator.forward(&request).await?;

    let completion_tokens = completed
        .completion_tokens
        .unwrap_or_else(|| estimate_tokens(completed.content.len()));
    let response = ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: Utc::now().timestamp(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new("assistant", completed.content),
            finish_reason: "stop",
        }],
        usage: ChatUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };
    Ok(Json(response).into_response())
}

async fn stream_completion(
    state: Arc<AppState>,
    request: CompletionRequest,
) -> Result<Response, GatewayError> {
    let id = completion_id();
    let created = Utc::now().timestamp();
    let model = request.model.clone();
    let heartbeat = state.config.timeouts.sse_heartbeat;

    let mut chunks = Arc::clone(&state.coordinator).forward_stream(request).await?;

    let events = stream! {
        yield sse_json(&ChatCompletionChunk::role_first(&id, created, &model));

        let mut failed = false;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(content) => {
                    yield sse_json(&ChatCompletionChunk::content(&id, created, &model, content));
                }
                Err(e) => {
                    tracing::warn!("Stream failed after retries: {e}");
                    yield sse_json(&serde_json::json!({
                        "error": {"message": e.to_string(), "type": "service_unavailable"}
                    }));
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            yield sse_json(&ChatCompletionChunk::stop(&id, created, &model));
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    // Comment heartbeats hold idle intermediaries open during prefill.
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(heartbeat).text(""));
    Ok(sse.into_response())
}

fn sse_json<T: serde::Serialize>(value: &T) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(value).unwrap_or_default()))
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        data: vec![ModelEntry {
            id: state.config.default_model.clone(),
            object: "model",
            created: Utc::now().timestamp(),
            owned_by: "meshgate",
        }],
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<GatewayHealth> {
    Json(GatewayHealth {
        status: "ok",
        nodes_total: state.registry.count().await,
        nodes_online: state.registry.count_online().await,
        connected_workers: state.relay.worker_count().await,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn nodes_handler(State(state): State<Arc<AppState>>) -> Json<NodesSnapshot> {
    let now = Instant::now();
    let nodes = state
        .registry
        .snapshot_all()
        .await
        .into_iter()
        .map(|node| NodeView {
            url: node.url,
            address: node.address,
            status: match node.status {
                NodeStatus::Online => "online",
                NodeStatus::Offline => "offline",
            },
            node_type: node.node_type.as_str(),
            capacity: node.capacity,
            in_flight: node.in_flight,
            consecutive_failures: node.consecutive_failures,
            cooldown_remaining_secs: node
                .cooldown_until
                .filter(|until| *until > now)
                .map(|until| until.duration_since(now).as_secs()),
        })
        .collect();
    let workers = state
        .relay
        .connected_workers()
        .await
        .into_iter()
        .map(|worker| WorkerView {
            address: worker.address,
            model: worker.model,
            connected_at: worker.connected_at.to_rfc3339(),
        })
        .collect();
    Json(NodesSnapshot { nodes, workers })
}
