//! Client for the oracle discovery/metrics service.

pub mod discovery;

pub use discovery::{Discovery, TopologyCache};

use serde::{Deserialize, Serialize};

use crate::error::OracleError;

/// A node entry from `GET /api/nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub endpoint: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
struct NodeListResponse {
    #[serde(default)]
    nodes: Vec<NodeEntry>,
}

/// One member of a pipeline topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyNode {
    pub address: String,
    pub http_endpoint: String,
    #[serde(default)]
    pub layer_start: u32,
    #[serde(default)]
    pub layer_end: u32,
    #[serde(default)]
    pub pipeline_order: u32,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub benchmark_tok_per_sec: Option<f64>,
}

impl TopologyNode {
    /// Only the entry node (pipeline order 0) can serve a request alone.
    pub fn is_entry(&self) -> bool {
        self.pipeline_order == 0
    }
}

/// Advisory sharding description of a model across pipeline nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub model: String,
    #[serde(default)]
    pub nodes: Vec<TopologyNode>,
}

impl Topology {
    /// Total layer count, derived from the largest layer range end.
    pub fn total_layers(&self) -> u32 {
        self.nodes.iter().map(|n| n.layer_end).max().unwrap_or(0)
    }
}

/// A per-node capacity benchmark from `GET /api/v1/metrics/capacity`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityMetric {
    pub address: String,
    #[serde(default)]
    pub benchmark_tok_per_sec: f64,
}

/// Per-worker usage aggregate posted to `POST /api/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub wallet: String,
    pub tokens_processed: u64,
    pub request_count: u64,
    pub avg_latency_ms: u64,
    pub uptime_seconds: u64,
    pub timestamp: i64,
    pub signature: String,
}

/// HTTP client for the oracle.
pub struct OracleClient {
    client: reqwest::Client,
    base_url: String,
}

impl OracleClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch_nodes(&self) -> Result<Vec<NodeEntry>, OracleError> {
        let url = format!("{}/api/nodes", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(OracleError::Status {
                status: resp.status().as_u16(),
            });
        }
        let body: NodeListResponse = resp.json().await?;
        Ok(body.nodes)
    }

    pub async fn fetch_topology(&self, model: &str) -> Result<Topology, OracleError> {
        let url = format!("{}/api/v1/pipeline/topology", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("model", model)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(OracleError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn fetch_capacity(&self) -> Result<Vec<CapacityMetric>, OracleError> {
        let url = format!("{}/api/v1/metrics/capacity", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(OracleError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn report_usage(&self, report: &UsageReport) -> Result<(), OracleError> {
        let url = format!("{}/api/metrics", self.base_url);
        let resp = self.client.post(&url).json(report).send().await?;
        if !resp.status().is_success() {
            return Err(OracleError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
