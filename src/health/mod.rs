//! Periodic health probing of registered nodes.
//!
//! A probe is a GET to `{url}/health` with a short timeout. Successful
//! probes bring a node online and classify its protocol from the body;
//! failures feed the registry's failure accounting.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::registry::{NodeRegistry, NodeType};

/// Lenient health probe body. Nodes report either `{"status":"ok"}` or
/// `{"mode":"pipeline", ...}`.
#[derive(Debug, Default, Deserialize)]
pub struct HealthBody {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Infer the node type from a probe body. A pipeline report always wins;
/// an unknown node that answers the OpenAI-style probe becomes `openai`;
/// otherwise the current classification stands.
pub fn infer_type(body: &HealthBody, current: NodeType) -> Option<NodeType> {
    if body.mode.as_deref() == Some("pipeline") {
        return Some(NodeType::Pipeline);
    }
    if current == NodeType::Unknown {
        return Some(NodeType::OpenAi);
    }
    None
}

pub struct HealthProber {
    client: reqwest::Client,
    registry: Arc<NodeRegistry>,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<NodeRegistry>, probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            probe_timeout,
        }
    }

    /// Run the probe loop. `probe_rx` carries URLs of newly discovered
    /// nodes that deserve an immediate probe between ticks.
    pub async fn run(
        self,
        interval: Duration,
        mut probe_rx: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                Some(url) = probe_rx.recv() => self.probe_one(&url).await,
                _ = shutdown.changed() => {
                    tracing::debug!("Health prober stopping");
                    break;
                }
            }
        }
    }

    /// Probe every registered node concurrently over a registry snapshot.
    pub async fn probe_all(&self) {
        let nodes = self.registry.snapshot_all().await;
        let probes = nodes.iter().map(|node| self.probe_one(&node.url));
        join_all(probes).await;
    }

    async fn probe_one(&self, url: &str) {
        let current = match self.registry.get(url).await {
            Some(node) => node.node_type,
            None => return,
        };

        match self.fetch_health(url).await {
            Ok(body) => {
                self.registry
                    .mark_probed(url, infer_type(&body, current))
                    .await;
            }
            Err(e) => {
                tracing::debug!(url = %url, "Health probe failed: {e}");
                self.registry.increment_failure(url).await;
            }
        }
    }

    /// GET `{url}/health`, bounded by the probe timeout.
    pub async fn fetch_health(&self, url: &str) -> Result<HealthBody, reqwest::Error> {
        let resp = self
            .client
            .get(format!("{url}/health"))
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;
        // An unparseable body still counts as a successful probe.
        Ok(resp.json().await.unwrap_or_default())
    }
}
