//! Error types for the gateway.
//!
//! Each subsystem has its own error enum; `GatewayError` is the surface the
//! HTTP layer maps onto client responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors from the node registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid node URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unknown node: {url}")]
    UnknownNode { url: String },
}

/// Errors from the oracle client.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Oracle returned HTTP {status}")]
    Status { status: u16 },
}

impl OracleError {
    /// True when the oracle was simply unreachable (it may legitimately be
    /// down; logged at debug rather than warn).
    pub fn is_connect(&self) -> bool {
        matches!(self, OracleError::Request(e) if e.is_connect())
    }
}

/// Errors from the worker relay back-channel.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No connected worker for address {address}")]
    NotConnected { address: String },

    #[error("Worker {address} disconnected")]
    Disconnected { address: String },

    #[error("Worker request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Worker reported error: {message}")]
    Worker { message: String },

    #[error("Failed to send frame to worker {address}: {reason}")]
    Send { address: String, reason: String },

    #[error("Relay shutting down")]
    Shutdown,
}

/// Errors from a single forwarding attempt against one node.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("Node {url} returned HTTP {status}: {reason}")]
    Upstream {
        url: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Stream from {url} interrupted: {reason}")]
    Stream { url: String, reason: String },

    #[error("Attempt against {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ForwardError {
    /// Connection-level failures flip the node offline immediately instead
    /// of waiting for the failure threshold.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            ForwardError::Connect { .. } | ForwardError::Relay(RelayError::NotConnected { .. })
        )
    }
}

/// Configuration errors raised at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Either ORACLE_URL or STATIC_NODE_URLS must be configured")]
    MissingNodeSource,

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Client-facing errors on the inference path.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{reason}")]
    Validation { reason: String },

    #[error("Missing or invalid authorization")]
    Unauthorized,

    #[error("{reason}")]
    Tier { reason: String },

    #[error("Rate limit exceeded, retry later")]
    RateLimited,

    #[error("No inference nodes available")]
    NoCandidates,

    #[error("All nodes failed after {attempts} attempts")]
    AllNodesFailed { attempts: usize },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Tier { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoCandidates | GatewayError::AllNodesFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "invalid_request_error",
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::Tier { .. } => "permission_error",
            GatewayError::RateLimited => "rate_limit_error",
            GatewayError::NoCandidates | GatewayError::AllNodesFailed { .. } => {
                "service_unavailable"
            }
            GatewayError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
