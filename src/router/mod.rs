//! Retry coordinator: drives the candidate loop with failure accounting
//! and streaming continuation.
//!
//! A request gets up to `min(pool size, 5)` attempts. Failed nodes are
//! excluded and penalized; a streaming failure mid-response is recovered
//! by sending the next node a continuation request that embeds everything
//! already yielded, so the caller sees one uninterrupted stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{ForwardError, GatewayError};
use crate::forwarder::Forwarder;
use crate::registry::{Node, NodeRegistry, NodeStatus};
use crate::selector::CandidateSelector;
use crate::types::{estimate_tokens, ChatMessage, CompletionRequest, CompletionResponse};
use crate::usage::UsageTracker;

/// Upper bound on attempts per request, regardless of pool size.
pub const MAX_ATTEMPTS: usize = 5;

const CONTINUE_INSTRUCTION: &str =
    "Continue generating from exactly where you left off. Do not repeat any text.";

/// Chunks yielded to the client, ending with either stream end or an error.
pub type GatewayStream = BoxStream<'static, Result<String, GatewayError>>;

/// Build the follow-up request for a retry after a partial stream.
///
/// Chat requests get the accumulated text as an assistant turn plus a
/// "continue" instruction; prompt-only requests get the text appended to
/// the prompt body. Sampling parameters are left unchanged.
pub fn continuation_request(original: &CompletionRequest, accumulated: &str) -> CompletionRequest {
    let mut request = original.clone();
    if !request.messages.is_empty() {
        request
            .messages
            .push(ChatMessage::new("assistant", accumulated));
        request
            .messages
            .push(ChatMessage::new("user", CONTINUE_INSTRUCTION));
    } else if let Some(prompt) = &original.prompt {
        request.prompt = Some(format!(
            "{prompt}\n\nAssistant (partial, continue from here): {accumulated}"
        ));
    }
    request
}

pub struct RetryCoordinator {
    selector: Arc<CandidateSelector>,
    forwarder: Arc<Forwarder>,
    registry: Arc<NodeRegistry>,
    usage: Arc<UsageTracker>,
}

impl RetryCoordinator {
    pub fn new(
        selector: Arc<CandidateSelector>,
        forwarder: Arc<Forwarder>,
        registry: Arc<NodeRegistry>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            selector,
            forwarder,
            registry,
            usage,
        }
    }

    /// Forward a unary request, retrying across candidates.
    pub async fn forward(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let pool = self.selector.assemble(&HashSet::new()).await;
        if pool.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        let retries = pool.len().min(MAX_ATTEMPTS);
        let mut excluded: HashSet<String> = HashSet::new();

        for attempt in 1..=retries {
            let Some(node) = self.selector.select(&excluded).await else {
                break;
            };
            excluded.insert(node.url.clone());
            let _guard = self.selector.acquire(&node).await;
            let started = Instant::now();

            match self.forwarder.forward(&node, request).await {
                Ok(response) => {
                    self.record_success(
                        &node,
                        response.completion_tokens,
                        response.content.len(),
                        started,
                    )
                    .await;
                    return Ok(response);
                }
                Err(e) => self.record_failure(&node, &e, attempt).await,
            }
        }
        Err(GatewayError::AllNodesFailed { attempts: retries })
    }

    /// Forward a streaming request. The returned stream is the
    /// concatenation of per-attempt streams in attempt order; retries are
    /// invisible to the caller.
    pub async fn forward_stream(
        self: Arc<Self>,
        request: CompletionRequest,
    ) -> Result<GatewayStream, GatewayError> {
        let pool = self.selector.assemble(&HashSet::new()).await;
        if pool.is_empty() {
            return Err(GatewayError::NoCandidates);
        }
        let retries = pool.len().min(MAX_ATTEMPTS);

        let coordinator = self;
        let chunks = stream! {
            let mut excluded: HashSet<String> = HashSet::new();
            let mut accumulated = String::new();

            for attempt in 1..=retries {
                let Some(node) = coordinator.selector.select(&excluded).await else {
                    break;
                };
                excluded.insert(node.url.clone());
                let guard = coordinator.selector.acquire(&node).await;
                let started = Instant::now();

                let effective = if accumulated.is_empty() {
                    request.clone()
                } else {
                    continuation_request(&request, &accumulated)
                };

                let mut failed = false;
                match coordinator.forwarder.forward_stream(&node, &effective).await {
                    Ok(mut attempt_chunks) => {
                        let yielded_before = accumulated.len();
                        while let Some(item) = attempt_chunks.next().await {
                            match item {
                                Ok(chunk) => {
                                    accumulated.push_str(&chunk);
                                    yield Ok(chunk);
                                }
                                Err(e) => {
                                    coordinator.record_failure(&node, &e, attempt).await;
                                    failed = true;
                                    break;
                                }
                            }
                        }
                        if !failed {
                            coordinator
                                .record_success(
                                    &node,
                                    None,
                                    accumulated.len() - yielded_before,
                                    started,
                                )
                                .await;
                            drop(guard);
                            return;
                        }
                    }
                    Err(e) => coordinator.record_failure(&node, &e, attempt).await,
                }
                drop(guard);
            }
            yield Err(GatewayError::AllNodesFailed { attempts: retries });
        };
        Ok(chunks.boxed())
    }

    async fn record_success(
        &self,
        node: &Node,
        reported_tokens: Option<u32>,
        content_len: usize,
        started: Instant,
    ) {
        self.registry.reset_failure(&node.url).await;
        if let Some(address) = &node.address {
            let tokens = reported_tokens.unwrap_or_else(|| estimate_tokens(content_len));
            self.usage
                .record(address, tokens as u64, started.elapsed().as_millis() as u64)
                .await;
        }
    }

    async fn record_failure(&self, node: &Node, err: &ForwardError, attempt: usize) {
        tracing::warn!(url = %node.url, attempt, "Attempt failed: {err}");
        self.registry.increment_failure(&node.url).await;
        if err.is_connect() {
            self.registry.set_status(&node.url, NodeStatus::Offline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::oracle::TopologyCache;
    use crate::registry::NodeType;
    use crate::relay::WorkerRelay;
    use axum::extract::State;
    use axum::http::header;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::time::Duration;
    use tokio::sync::{Mutex, RwLock};

    async fn spawn_node(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fixture(registry: Arc<NodeRegistry>) -> Arc<RetryCoordinator> {
        let mut timeouts = TimeoutConfig::default();
        timeouts.attempt = Duration::from_secs(5);
        timeouts.stream_inactivity = Duration::from_secs(5);
        let relay = Arc::new(WorkerRelay::new(&timeouts));
        let topology: TopologyCache = Arc::new(RwLock::new(None));
        let selector = Arc::new(CandidateSelector::new(
            Arc::clone(&registry),
            Arc::clone(&relay),
            topology,
        ));
        let forwarder = Arc::new(Forwarder::new(relay, Arc::clone(&registry), &timeouts));
        let usage = Arc::new(UsageTracker::new(Duration::from_secs(60)));
        Arc::new(RetryCoordinator::new(selector, forwarder, registry, usage))
    }

    /// Insert a stub-backed node. Capacity skew makes the selection order
    /// deterministic in practice.
    async fn seed_node(registry: &NodeRegistry, url: &str, capacity: f64) {
        let mut node = Node::new(url);
        node.node_type = NodeType::OpenAi;
        node.capacity = capacity;
        registry.insert_unchecked(node).await;
    }

    fn chat_request() -> CompletionRequest {
        CompletionRequest {
            model: "llama".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            prompt: None,
            max_tokens: Some(16),
            temperature: None,
            top_p: None,
        }
    }

    #[test]
    fn test_continuation_request_chat_form() {
        let request = chat_request();
        let continuation = continuation_request(&request, "Hello world");
        assert_eq!(continuation.messages.len(), 3);
        assert_eq!(continuation.messages[1].role, "assistant");
        assert_eq!(continuation.messages[1].content, "Hello world");
        assert_eq!(continuation.messages[2].role, "user");
        assert_eq!(continuation.messages[2].content, CONTINUE_INSTRUCTION);
        assert_eq!(continuation.max_tokens, request.max_tokens);
    }

    #[test]
    fn test_continuation_request_prompt_form() {
        let request = CompletionRequest {
            model: "llama".to_string(),
            messages: Vec::new(),
            prompt: Some("Tell me a story.".to_string()),
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        let continuation = continuation_request(&request, "Once upon");
        let prompt = continuation.prompt.unwrap();
        assert!(prompt.starts_with("Tell me a story."));
        assert!(prompt.contains("Assistant (partial, continue from here): Once upon"));
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_candidates() {
        let registry = Arc::new(NodeRegistry::new(false));
        let coordinator = fixture(registry);
        assert!(matches!(
            coordinator.forward(&chat_request()).await,
            Err(GatewayError::NoCandidates)
        ));
    }

    #[tokio::test]
    async fn test_failover_on_5xx() {
        let failing = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let healthy = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "from B"}}],
                    "usage": {"completion_tokens": 2}
                }))
            }),
        );
        let url_a = spawn_node(failing).await;
        let url_b = spawn_node(healthy).await;

        let registry = Arc::new(NodeRegistry::new(false));
        // Heavy skew: A is effectively always drawn first.
        seed_node(&registry, &url_a, 100_000.0).await;
        seed_node(&registry, &url_b, 0.0).await;
        let coordinator = fixture(Arc::clone(&registry));

        let response = coordinator.forward(&chat_request()).await.unwrap();
        assert_eq!(response.content, "from B");

        let node_a = registry.get(&url_a).await.unwrap();
        assert_eq!(node_a.consecutive_failures, 1);
        assert_eq!(node_a.status, NodeStatus::Online);
        assert_eq!(registry.get(&url_b).await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_all_nodes_failed() {
        let failing = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let url = spawn_node(failing).await;

        let registry = Arc::new(NodeRegistry::new(false));
        seed_node(&registry, &url, 1.0).await;
        let coordinator = fixture(registry);

        assert!(matches!(
            coordinator.forward(&chat_request()).await,
            Err(GatewayError::AllNodesFailed { attempts: 1 })
        ));
    }

    #[tokio::test]
    async fn test_streaming_continuation_across_failure() {
        // Node A streams two chunks then drops without [DONE].
        let interrupted = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
                );
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );

        // Node B only serves continuation requests, and records what it saw.
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let continuation = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    |State(seen): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        let is_continuation = body["messages"]
                            .as_array()
                            .map(|m| m.len() > 1)
                            .unwrap_or(false);
                        seen.lock().await.push(body);
                        if !is_continuation {
                            return Err(axum::http::StatusCode::SERVICE_UNAVAILABLE);
                        }
                        let body = concat!(
                            "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n",
                            "data: [DONE]\n\n",
                        );
                        Ok(([(header::CONTENT_TYPE, "text/event-stream")], body))
                    },
                ),
            )
            .with_state(Arc::clone(&seen));

        let url_a = spawn_node(interrupted).await;
        let url_b = spawn_node(continuation).await;

        let registry = Arc::new(NodeRegistry::new(false));
        seed_node(&registry, &url_a, 100_000.0).await;
        seed_node(&registry, &url_b, 0.0).await;
        let coordinator = fixture(Arc::clone(&registry));

        let mut chunks = coordinator
            .forward_stream(chat_request())
            .await
            .unwrap();
        let mut collected = String::new();
        while let Some(item) = chunks.next().await {
            collected.push_str(&item.unwrap());
        }
        assert_eq!(collected, "Hello world!");

        // B saw the accumulated text as an assistant turn plus the
        // continue instruction.
        let seen = seen.lock().await;
        let continuation_body = seen.last().unwrap();
        let messages = continuation_body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "Hello world");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], CONTINUE_INSTRUCTION);
    }

    #[tokio::test]
    async fn test_stream_with_no_candidates() {
        let registry = Arc::new(NodeRegistry::new(false));
        let coordinator = fixture(registry);
        assert!(matches!(
            coordinator.forward_stream(chat_request()).await,
            Err(GatewayError::NoCandidates)
        ));
    }
}
