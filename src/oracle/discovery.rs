//! Periodic oracle discovery.
//!
//! Each cycle makes three best-effort calls: the node list, the pipeline
//! topology for the configured model, and the capacity metrics. Any of the
//! three may fail without affecting the others.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};

use crate::error::OracleError;
use crate::oracle::{OracleClient, Topology};
use crate::registry::{NodeRegistry, NodeSeed, NodeStatus};

/// Shared, most-recently-fetched topology. `None` until the first
/// successful fetch.
pub type TopologyCache = Arc<RwLock<Option<Topology>>>;

/// The discovery loop.
pub struct Discovery {
    oracle: Arc<OracleClient>,
    registry: Arc<NodeRegistry>,
    topology: TopologyCache,
    model: String,
    /// Newly discovered node URLs are pushed here for an immediate probe.
    probe_tx: mpsc::Sender<String>,
}

impl Discovery {
    pub fn new(
        oracle: Arc<OracleClient>,
        registry: Arc<NodeRegistry>,
        topology: TopologyCache,
        model: String,
        probe_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            oracle,
            registry,
            topology,
            model,
            probe_tx,
        }
    }

    pub async fn run(self, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = shutdown.changed() => {
                    tracing::debug!("Discovery loop stopping");
                    break;
                }
            }
        }
    }

    /// One discovery cycle. Each oracle call is independently skippable.
    pub async fn cycle(&self) {
        match self.oracle.fetch_nodes().await {
            Ok(nodes) => self.apply_node_list(nodes).await,
            Err(e) => log_oracle_error("node list", &e),
        }

        match self.oracle.fetch_topology(&self.model).await {
            Ok(topology) => self.apply_topology(topology).await,
            Err(e) => log_oracle_error("topology", &e),
        }

        match self.oracle.fetch_capacity().await {
            Ok(metrics) => self.apply_capacity(metrics).await,
            Err(e) => log_oracle_error("capacity metrics", &e),
        }
    }

    async fn apply_node_list(&self, nodes: Vec<crate::oracle::NodeEntry>) {
        for entry in nodes {
            let endpoint = entry.endpoint.trim_end_matches('/').to_string();
            // Seed offline with a zero capacity baseline; the prober brings
            // the node online and the capacity feed fills in the benchmark.
            let seed = NodeSeed {
                address: Some(entry.address),
                status: Some(NodeStatus::Offline),
                capacity: None,
            };
            match self.registry.upsert(&endpoint, seed).await {
                Ok(true) => {
                    self.registry.set_capacity(&endpoint, 0.0).await;
                    if self.probe_tx.send(endpoint.clone()).await.is_err() {
                        tracing::debug!("Probe channel closed, skipping immediate probe");
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(endpoint = %endpoint, "Rejected oracle node: {e}"),
            }
        }
    }

    async fn apply_topology(&self, topology: Topology) {
        for node in &topology.nodes {
            let endpoint = node.http_endpoint.trim_end_matches('/').to_string();
            let seed = NodeSeed {
                address: Some(node.address.clone()),
                status: Some(NodeStatus::Offline),
                capacity: node.benchmark_tok_per_sec,
            };
            match self.registry.upsert(&endpoint, seed).await {
                Ok(true) => {
                    if self.probe_tx.send(endpoint.clone()).await.is_err() {
                        tracing::debug!("Probe channel closed, skipping immediate probe");
                    }
                }
                Ok(false) => {
                    if let Some(benchmark) = node.benchmark_tok_per_sec {
                        self.registry.set_capacity(&endpoint, benchmark).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, "Rejected topology node: {e}")
                }
            }
        }

        tracing::debug!(
            model = %topology.model,
            members = topology.nodes.len(),
            total_layers = topology.total_layers(),
            "Topology updated"
        );
        *self.topology.write().await = Some(topology);
    }

    async fn apply_capacity(&self, metrics: Vec<crate::oracle::CapacityMetric>) {
        for metric in metrics {
            if metric.benchmark_tok_per_sec <= 0.0 {
                continue;
            }
            if let Some(node) = self.registry.find_by_address(&metric.address).await {
                self.registry
                    .set_capacity(&node.url, metric.benchmark_tok_per_sec)
                    .await;
            }
        }
    }
}

fn log_oracle_error(what: &str, err: &OracleError) {
    if err.is_connect() {
        tracing::debug!("Oracle unreachable fetching {what}: {err}");
    } else {
        tracing::warn!("Failed to fetch {what} from oracle: {err}");
    }
}
