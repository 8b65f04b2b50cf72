//! Forwarder: executes a single attempt against a chosen node in its
//! native protocol.
//!
//! Three paths: the worker relay back-channel, OpenAI-compatible HTTP, and
//! pipeline HTTP. An `unknown` node is probed with the OpenAI path first; a
//! 404 reclassifies it as pipeline and the same attempt is retried there.

pub mod sse;
pub mod strip;

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::TimeoutConfig;
use crate::error::ForwardError;
use crate::registry::{Node, NodeRegistry, NodeType};
use crate::relay::{StreamEvent, WorkerRelay};
use crate::types::{ChatMessage, CompletionRequest, CompletionResponse};

use sse::SseDecoder;
use strip::strip_channel_markers;

/// Chunks yielded by a streaming attempt.
pub type ChunkStream = BoxStream<'static, Result<String, ForwardError>>;

pub struct Forwarder {
    client: reqwest::Client,
    relay: Arc<WorkerRelay>,
    registry: Arc<NodeRegistry>,
    attempt_timeout: Duration,
    stream_inactivity: Duration,
}

impl Forwarder {
    pub fn new(relay: Arc<WorkerRelay>, registry: Arc<NodeRegistry>, timeouts: &TimeoutConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay,
            registry,
            attempt_timeout: timeouts.attempt,
            stream_inactivity: timeouts.stream_inactivity,
        }
    }

    /// Execute one unary attempt.
    pub async fn forward(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ForwardError> {
        match node.node_type {
            NodeType::Relay => self.forward_relay(node, request).await,
            NodeType::OpenAi => {
                self.with_deadline(&node.url, self.forward_openai(node, request))
                    .await
            }
            NodeType::Pipeline => {
                self.with_deadline(&node.url, self.forward_pipeline(node, request))
                    .await
            }
            NodeType::Unknown => {
                match self
                    .with_deadline(&node.url, self.forward_openai(node, request))
                    .await
                {
                    Ok(response) => {
                        self.registry.set_type(&node.url, NodeType::OpenAi).await;
                        Ok(response)
                    }
                    Err(ForwardError::Upstream { status: 404, .. }) => {
                        tracing::debug!(url = %node.url, "404 on chat completions, retrying as pipeline");
                        self.registry.set_type(&node.url, NodeType::Pipeline).await;
                        self.with_deadline(&node.url, self.forward_pipeline(node, request))
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Execute one streaming attempt. Chunks are yielded in arrival order.
    pub async fn forward_stream(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ForwardError> {
        match node.node_type {
            NodeType::Relay => self.stream_relay(node, request).await,
            NodeType::OpenAi => self.stream_openai(node, request).await,
            NodeType::Pipeline => self.stream_pipeline(node, request).await,
            NodeType::Unknown => match self.stream_openai(node, request).await {
                Ok(chunks) => {
                    self.registry.set_type(&node.url, NodeType::OpenAi).await;
                    Ok(chunks)
                }
                Err(ForwardError::Upstream { status: 404, .. }) => {
                    tracing::debug!(url = %node.url, "404 on chat completions, retrying as pipeline");
                    self.registry.set_type(&node.url, NodeType::Pipeline).await;
                    self.stream_pipeline(node, request).await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn with_deadline<T>(
        &self,
        url: &str,
        fut: impl std::future::Future<Output = Result<T, ForwardError>>,
    ) -> Result<T, ForwardError> {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout {
                url: url.to_string(),
                seconds: self.attempt_timeout.as_secs(),
            }),
        }
    }

    // ---- Relay path ----

    fn relay_address(node: &Node) -> Result<&str, ForwardError> {
        node.address
            .as_deref()
            .ok_or_else(|| ForwardError::InvalidResponse {
                url: node.url.clone(),
                reason: "relay candidate without an address".to_string(),
            })
    }

    async fn forward_relay(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ForwardError> {
        let address = Self::relay_address(node)?;
        let response = self.relay.send_request(address, request).await?;
        Ok(CompletionResponse {
            content: response.content,
            completion_tokens: None,
            node_address: node.address.clone(),
        })
    }

    async fn stream_relay(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ForwardError> {
        let address = Self::relay_address(node)?;
        let mut rx = self.relay.send_stream_request(address, request).await?;
        let url = node.url.clone();
        let chunks = stream! {
            loop {
                match rx.recv().await {
                    Some(StreamEvent::Chunk(content)) => yield Ok(content),
                    Some(StreamEvent::Done(_)) => break,
                    Some(StreamEvent::Failed(e)) => {
                        yield Err(ForwardError::from(e));
                        break;
                    }
                    None => {
                        yield Err(ForwardError::Stream {
                            url: url.clone(),
                            reason: "relay stream closed unexpectedly".to_string(),
                        });
                        break;
                    }
                }
            }
        };
        Ok(chunks.boxed())
    }

    // ---- OpenAI-compatible HTTP path ----

    async fn forward_openai(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ForwardError> {
        let body = ChatHttpRequest::from_request(request, false);
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", node.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&node.url, e))?;
        let resp = check_status(&node.url, resp).await?;

        let parsed: ChatHttpResponse =
            resp.json().await.map_err(|e| ForwardError::InvalidResponse {
                url: node.url.clone(),
                reason: e.to_string(),
            })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ForwardError::InvalidResponse {
                url: node.url.clone(),
                reason: "no choices in response".to_string(),
            })?;
        Ok(CompletionResponse {
            content: strip_channel_markers(&choice.message.content.unwrap_or_default()),
            completion_tokens: parsed.usage.and_then(|u| u.completion_tokens),
            node_address: node.address.clone(),
        })
    }

    async fn stream_openai(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ForwardError> {
        let body = ChatHttpRequest::from_request(request, true);
        let send = self
            .client
            .post(format!("{}/v1/chat/completions", node.url))
            .json(&body)
            .send();
        let resp = self
            .with_deadline(&node.url, async {
                send.await.map_err(|e| map_reqwest_error(&node.url, e))
            })
            .await?;
        let resp = check_status(&node.url, resp).await?;

        let url = node.url.clone();
        let inactivity = self.stream_inactivity;
        let mut bytes = resp.bytes_stream();
        let chunks = stream! {
            let mut decoder = SseDecoder::new();
            'outer: loop {
                let read = tokio::time::timeout(inactivity, bytes.next()).await;
                let chunk = match read {
                    Err(_) => {
                        yield Err(ForwardError::Timeout {
                            url: url.clone(),
                            seconds: inactivity.as_secs(),
                        });
                        break;
                    }
                    Ok(None) => {
                        // EOF before the [DONE] sentinel is an interrupted
                        // stream, not a completed one.
                        yield Err(ForwardError::Stream {
                            url: url.clone(),
                            reason: "stream ended before [DONE]".to_string(),
                        });
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        yield Err(ForwardError::Stream {
                            url: url.clone(),
                            reason: e.to_string(),
                        });
                        break;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };
                for payload in decoder.push(&chunk) {
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(frame) = serde_json::from_str::<ChatStreamFrame>(&payload) else {
                        continue;
                    };
                    if let Some(content) = frame
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                    {
                        let content = strip_channel_markers(&content);
                        if !content.is_empty() {
                            yield Ok(content);
                        }
                    }
                }
            }
        };
        Ok(chunks.boxed())
    }

    // ---- Pipeline HTTP path ----

    async fn forward_pipeline(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ForwardError> {
        let body = GenerateHttpRequest::from_request(request, false);
        let resp = self
            .client
            .post(format!("{}/api/v1/generate", node.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&node.url, e))?;
        let resp = check_status(&node.url, resp).await?;

        let parsed: GenerateHttpResponse =
            resp.json().await.map_err(|e| ForwardError::InvalidResponse {
                url: node.url.clone(),
                reason: e.to_string(),
            })?;
        Ok(CompletionResponse {
            content: strip_channel_markers(&parsed.generated_text),
            completion_tokens: parsed.num_tokens,
            node_address: node.address.clone(),
        })
    }

    async fn stream_pipeline(
        &self,
        node: &Node,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ForwardError> {
        let body = GenerateHttpRequest::from_request(request, true);
        let send = self
            .client
            .post(format!("{}/api/v1/generate", node.url))
            .json(&body)
            .send();
        let resp = self
            .with_deadline(&node.url, async {
                send.await.map_err(|e| map_reqwest_error(&node.url, e))
            })
            .await?;
        let resp = check_status(&node.url, resp).await?;

        let url = node.url.clone();
        let inactivity = self.stream_inactivity;
        let mut bytes = resp.bytes_stream();
        let chunks = stream! {
            let mut decoder = SseDecoder::new();
            'outer: loop {
                let read = tokio::time::timeout(inactivity, bytes.next()).await;
                let chunk = match read {
                    Err(_) => {
                        yield Err(ForwardError::Timeout {
                            url: url.clone(),
                            seconds: inactivity.as_secs(),
                        });
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield Err(ForwardError::Stream {
                            url: url.clone(),
                            reason: e.to_string(),
                        });
                        break;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };
                for payload in decoder.push(&chunk) {
                    match serde_json::from_str::<serde_json::Value>(&payload) {
                        Ok(frame) => {
                            if let Some(error) = frame.get("error") {
                                yield Err(ForwardError::Stream {
                                    url: url.clone(),
                                    reason: error.to_string(),
                                });
                                break 'outer;
                            }
                            let token = match frame.get("token") {
                                Some(serde_json::Value::String(s)) => Some(s.clone()),
                                // TGI-style nested token object.
                                Some(serde_json::Value::Object(o)) => o
                                    .get("text")
                                    .and_then(|t| t.as_str())
                                    .map(|t| t.to_string()),
                                _ => None,
                            };
                            if let Some(token) = token {
                                let token = strip_channel_markers(&token);
                                if !token.is_empty() {
                                    yield Ok(token);
                                }
                            }
                        }
                        // Fall back to the raw payload when a frame is not
                        // valid JSON.
                        Err(_) => yield Ok(strip_channel_markers(&payload)),
                    }
                }
            }
        };
        Ok(chunks.boxed())
    }
}

/// Flatten a request into chat messages for protocols that need them.
fn effective_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
    if !request.messages.is_empty() {
        return request.messages.clone();
    }
    match &request.prompt {
        Some(prompt) => vec![ChatMessage::new("user", prompt.clone())],
        None => Vec::new(),
    }
}

/// Flatten a request into a single prompt string for the pipeline path.
fn effective_inputs(request: &CompletionRequest) -> String {
    if let Some(prompt) = &request.prompt {
        return prompt.clone();
    }
    let mut inputs = String::new();
    for message in &request.messages {
        inputs.push_str(&message.role);
        inputs.push_str(": ");
        inputs.push_str(&message.content);
        inputs.push('\n');
    }
    inputs.push_str("assistant:");
    inputs
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> ForwardError {
    if e.is_connect() {
        ForwardError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        ForwardError::Stream {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

async fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, ForwardError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let reason = resp.text().await.unwrap_or_default();
    Err(ForwardError::Upstream {
        url: url.to_string(),
        status: status.as_u16(),
        reason: truncate(&reason, 200),
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[derive(Debug, Serialize)]
struct ChatHttpRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

impl ChatHttpRequest {
    fn from_request(request: &CompletionRequest, stream: bool) -> Self {
        Self {
            model: request.model.clone(),
            messages: effective_messages(request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatHttpResponse {
    #[serde(default)]
    choices: Vec<ChatHttpChoice>,
    #[serde(default)]
    usage: Option<ChatHttpUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatHttpChoice {
    message: ChatHttpMessage,
}

#[derive(Debug, Deserialize)]
struct ChatHttpMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatHttpUsage {
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamFrame {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateHttpRequest {
    inputs: String,
    parameters: GenerateParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl GenerateHttpRequest {
    fn from_request(request: &CompletionRequest, stream: bool) -> Self {
        Self {
            inputs: effective_inputs(request),
            parameters: GenerateParameters {
                max_new_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
            },
            stream: stream.then_some(true),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GenerateHttpResponse {
    #[serde(default)]
    generated_text: String,
    #[serde(default)]
    num_tokens: Option<u32>,
}
