//! Node registry: the canonical map of known inference nodes.
//!
//! Nodes are keyed by URL. All mutation (status, counters, cooldown, type)
//! goes through this component; other subsystems only see cloned snapshots.

mod validate;

pub use validate::validate_node_url;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::RegistryError;

/// Consecutive failures at which a node flips offline and enters cooldown.
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long a node stays quarantined after crossing the failure threshold.
pub const COOLDOWN: Duration = Duration::from_secs(30);

/// Baseline capacity for nodes with no benchmark yet.
pub const DEFAULT_CAPACITY: f64 = 1.0;

/// Health status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Which forwarding protocol a node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// OpenAI-compatible `/v1/chat/completions`.
    OpenAi,
    /// Pipeline `/api/v1/generate`.
    Pipeline,
    /// Worker reached over the back-channel.
    Relay,
    /// Not yet probed; forwarder tries OpenAI first.
    Unknown,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::OpenAi => "openai",
            NodeType::Pipeline => "pipeline",
            NodeType::Relay => "relay",
            NodeType::Unknown => "unknown",
        }
    }
}

/// A candidate inference endpoint.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node URL; `relay://<address>` for back-channel candidates.
    pub url: String,
    /// Wallet address, lowercased. Used for dedup and usage attribution.
    pub address: Option<String>,
    pub status: NodeStatus,
    pub node_type: NodeType,
    /// Tokens/second benchmark.
    pub capacity: f64,
    /// Requests currently dispatched to this node.
    pub in_flight: u32,
    pub consecutive_failures: u32,
    /// While `now < cooldown_until`, the node is excluded from selection.
    pub cooldown_until: Option<Instant>,
    pub last_probe: Option<Instant>,
}

impl Node {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            address: None,
            status: NodeStatus::Online,
            node_type: NodeType::Unknown,
            capacity: DEFAULT_CAPACITY,
            in_flight: 0,
            consecutive_failures: 0,
            cooldown_until: None,
            last_probe: None,
        }
    }

    /// Synthetic node for a connected relay worker.
    pub fn relay(address: &str) -> Self {
        let address = address.to_lowercase();
        Self {
            url: format!("relay://{address}"),
            address: Some(address),
            status: NodeStatus::Online,
            node_type: NodeType::Relay,
            capacity: DEFAULT_CAPACITY,
            in_flight: 0,
            consecutive_failures: 0,
            cooldown_until: None,
            last_probe: None,
        }
    }

    /// Online and out of cooldown.
    pub fn is_available(&self, now: Instant) -> bool {
        self.status == NodeStatus::Online
            && self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }
}

/// Seed values applied on upsert. Fields left `None` keep existing state.
#[derive(Debug, Default)]
pub struct NodeSeed {
    pub address: Option<String>,
    pub status: Option<NodeStatus>,
    pub capacity: Option<f64>,
}

/// Keyed map of known nodes, safe for concurrent use.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
    allow_private_ips: bool,
}

impl NodeRegistry {
    pub fn new(allow_private_ips: bool) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            allow_private_ips,
        }
    }

    /// Insert a node or update its seeded fields. Validates the URL on
    /// first insertion; returns true when the node was newly inserted.
    pub async fn upsert(&self, url: &str, seed: NodeSeed) -> Result<bool, RegistryError> {
        let url = url.trim_end_matches('/').to_string();
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(&url) {
            if let Some(address) = seed.address {
                node.address = Some(address.to_lowercase());
            }
            if let Some(capacity) = seed.capacity {
                node.capacity = capacity;
            }
            return Ok(false);
        }

        validate_node_url(&url, self.allow_private_ips)?;

        let mut node = Node::new(url.clone());
        node.address = seed.address.map(|a| a.to_lowercase());
        if let Some(status) = seed.status {
            node.status = status;
        }
        if let Some(capacity) = seed.capacity {
            node.capacity = capacity;
        }
        tracing::info!(url = %url, "Registered node");
        nodes.insert(url, node);
        Ok(true)
    }

    pub async fn get(&self, url: &str) -> Option<Node> {
        self.nodes.read().await.get(url).cloned()
    }

    pub async fn set_status(&self, url: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.status = status;
        }
    }

    /// Increment the failure counter. Crossing the threshold flips the node
    /// offline and starts its cooldown. Returns the new counter value.
    pub async fn increment_failure(&self, url: &str) -> u32 {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(url) else {
            return 0;
        };
        node.consecutive_failures += 1;
        if node.consecutive_failures >= FAILURE_THRESHOLD {
            node.status = NodeStatus::Offline;
            node.cooldown_until = Some(Instant::now() + COOLDOWN);
            tracing::warn!(
                url = %url,
                failures = node.consecutive_failures,
                "Node crossed failure threshold, entering cooldown"
            );
        }
        node.consecutive_failures
    }

    /// Clear failure accounting after a successful attempt or probe.
    pub async fn reset_failure(&self, url: &str) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.consecutive_failures = 0;
            node.cooldown_until = None;
        }
    }

    pub async fn begin_cooldown(&self, url: &str, duration: Duration) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.cooldown_until = Some(Instant::now() + duration);
        }
    }

    pub async fn set_type(&self, url: &str, node_type: NodeType) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            if node.node_type != node_type {
                tracing::debug!(url = %url, node_type = node_type.as_str(), "Node type updated");
            }
            node.node_type = node_type;
        }
    }

    pub async fn set_capacity(&self, url: &str, capacity: f64) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.capacity = capacity;
        }
    }

    /// Record a successful probe: online, failures cleared, type inferred.
    pub async fn mark_probed(&self, url: &str, node_type: Option<NodeType>) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.status = NodeStatus::Online;
            node.consecutive_failures = 0;
            node.cooldown_until = None;
            node.last_probe = Some(Instant::now());
            if let Some(t) = node_type {
                node.node_type = t;
            }
        }
    }

    pub async fn snapshot_all(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn find_by_address(&self, address: &str) -> Option<Node> {
        let address = address.to_lowercase();
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.address.as_deref() == Some(address.as_str()))
            .cloned()
    }

    /// Bump the in-flight counter around a dispatch.
    pub async fn acquire_slot(&self, url: &str) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.in_flight += 1;
        }
    }

    /// Release a slot taken by `acquire_slot`. Saturating: counters never
    /// go negative even if a release races a node eviction.
    pub async fn release_slot(&self, url: &str) {
        if let Some(node) = self.nodes.write().await.get_mut(url) {
            node.in_flight = node.in_flight.saturating_sub(1);
        }
    }

    /// Insert a node bypassing URL validation. Tests stand up stub nodes on
    /// loopback, which production validation rejects.
    #[cfg(test)]
    pub(crate) async fn insert_unchecked(&self, node: Node) {
        self.nodes.write().await.insert(node.url.clone(), node);
    }

    pub async fn count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn count_online(&self) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let registry = NodeRegistry::new(false);
        let inserted = registry
            .upsert("http://node-a.example.com", NodeSeed::default())
            .await
            .unwrap();
        assert!(inserted);

        let node = registry.get("http://node-a.example.com").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.node_type, NodeType::Unknown);
        assert_eq!(node.capacity, DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn test_upsert_existing_keeps_state() {
        let registry = NodeRegistry::new(false);
        registry
            .upsert("http://node-a.example.com", NodeSeed::default())
            .await
            .unwrap();
        registry
            .set_type("http://node-a.example.com", NodeType::Pipeline)
            .await;

        let inserted = registry
            .upsert(
                "http://node-a.example.com",
                NodeSeed {
                    address: Some("0xABC".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!inserted);

        let node = registry.get("http://node-a.example.com").await.unwrap();
        assert_eq!(node.node_type, NodeType::Pipeline);
        assert_eq!(node.address.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_failure_threshold_flips_offline_with_cooldown() {
        let registry = NodeRegistry::new(false);
        registry
            .upsert("http://node-a.example.com", NodeSeed::default())
            .await
            .unwrap();

        for _ in 0..FAILURE_THRESHOLD {
            registry.increment_failure("http://node-a.example.com").await;
        }

        let node = registry.get("http://node-a.example.com").await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.cooldown_until.is_some());
        assert!(!node.is_available(Instant::now()));
    }

    #[tokio::test]
    async fn test_probe_clears_failures_and_cooldown() {
        let registry = NodeRegistry::new(false);
        registry
            .upsert("http://node-a.example.com", NodeSeed::default())
            .await
            .unwrap();
        for _ in 0..FAILURE_THRESHOLD {
            registry.increment_failure("http://node-a.example.com").await;
        }

        registry
            .mark_probed("http://node-a.example.com", Some(NodeType::OpenAi))
            .await;

        let node = registry.get("http://node-a.example.com").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.consecutive_failures, 0);
        assert!(node.cooldown_until.is_none());
        assert_eq!(node.node_type, NodeType::OpenAi);
    }

    #[tokio::test]
    async fn test_find_by_address_is_case_insensitive() {
        let registry = NodeRegistry::new(false);
        registry
            .upsert(
                "http://node-a.example.com",
                NodeSeed {
                    address: Some("0xAbCd".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let node = registry.find_by_address("0XABCD").await.unwrap();
        assert_eq!(node.url, "http://node-a.example.com");
    }

    #[tokio::test]
    async fn test_in_flight_pairing() {
        let registry = NodeRegistry::new(false);
        registry
            .upsert("http://node-a.example.com", NodeSeed::default())
            .await
            .unwrap();

        registry.acquire_slot("http://node-a.example.com").await;
        registry.acquire_slot("http://node-a.example.com").await;
        assert_eq!(
            registry.get("http://node-a.example.com").await.unwrap().in_flight,
            2
        );

        registry.release_slot("http://node-a.example.com").await;
        registry.release_slot("http://node-a.example.com").await;
        registry.release_slot("http://node-a.example.com").await;
        assert_eq!(
            registry.get("http://node-a.example.com").await.unwrap().in_flight,
            0
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_urls() {
        let registry = NodeRegistry::new(false);
        assert!(registry
            .upsert("http://localhost:8080", NodeSeed::default())
            .await
            .is_err());
        assert!(registry
            .upsert("ftp://node.example.com", NodeSeed::default())
            .await
            .is_err());
        assert!(registry
            .upsert("http://192.168.1.5", NodeSeed::default())
            .await
            .is_err());
    }
}
