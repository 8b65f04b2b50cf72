//! Candidate selection: pool assembly, deduplication, and the weighted
//! random draw.
//!
//! A pool is assembled fresh per call in fixed priority order: connected
//! relay workers first, then topology entry nodes, then the remaining
//! registry nodes. Identity is the URL plus the lowercased wallet address;
//! the first identity to arrive wins, so a live back-channel hides any
//! HTTP path to the same worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::sync::Mutex;

use crate::oracle::TopologyCache;
use crate::registry::{Node, NodeRegistry, NodeType};
use crate::relay::WorkerRelay;

/// Floor weight so a saturated or unbenchmarked node still gets picked
/// occasionally.
pub const MIN_WEIGHT: f64 = 0.1;

/// Selection weight: capacity discounted by in-flight depth.
pub fn weight(node: &Node) -> f64 {
    (node.capacity / (1.0 + node.in_flight as f64)).max(MIN_WEIGHT)
}

/// Draw one candidate with probability proportional to its weight.
pub fn pick_weighted<'a, R: Rng>(candidates: &'a [Node], rng: &mut R) -> Option<&'a Node> {
    match candidates.len() {
        0 => return None,
        1 => return candidates.first(),
        _ => {}
    }
    let weights: Vec<f64> = candidates.iter().map(weight).collect();
    let total: f64 = weights.iter().sum();
    let pick = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (node, w) in candidates.iter().zip(&weights) {
        cumulative += w;
        if pick < cumulative {
            return Some(node);
        }
    }
    candidates.last()
}

/// Assembles candidate pools and manages in-flight accounting around each
/// dispatch.
pub struct CandidateSelector {
    registry: Arc<NodeRegistry>,
    relay: Arc<WorkerRelay>,
    topology: TopologyCache,
    /// In-flight counters for relay candidates, which live outside the
    /// registry (their synthetic URL is not a node URL).
    relay_in_flight: Arc<Mutex<HashMap<String, u32>>>,
}

impl CandidateSelector {
    pub fn new(registry: Arc<NodeRegistry>, relay: Arc<WorkerRelay>, topology: TopologyCache) -> Self {
        Self {
            registry,
            relay,
            topology,
            relay_in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the deduplicated pool, skipping `excluded` URLs.
    pub async fn assemble(&self, excluded: &HashSet<String>) -> Vec<Node> {
        let now = Instant::now();
        let mut pool: Vec<Node> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut seen_addresses: HashSet<String> = HashSet::new();

        // 1. Live back-channel workers.
        let relay_counters = self.relay_in_flight.lock().await.clone();
        for worker in self.relay.connected_workers().await {
            let mut node = Node::relay(&worker.address);
            // An excluded relay entry still hides the HTTP path for the
            // same address; the next attempt should move to another worker.
            let newly_seen = seen_addresses.insert(worker.address.clone());
            if !newly_seen || excluded.contains(&node.url) {
                continue;
            }
            // Benchmarks are keyed by address; a relay worker inherits the
            // capacity recorded against its registry record, if any.
            if let Some(registered) = self.registry.find_by_address(&worker.address).await {
                if registered.capacity > 0.0 {
                    node.capacity = registered.capacity;
                }
            }
            node.in_flight = relay_counters.get(&node.url).copied().unwrap_or(0);
            seen_urls.insert(node.url.clone());
            pool.push(node);
        }

        // 2. Topology entry nodes not already represented by a relay entry.
        if let Some(topology) = self.topology.read().await.as_ref() {
            for member in &topology.nodes {
                if !member.is_entry() {
                    continue;
                }
                let address = member.address.to_lowercase();
                if seen_addresses.contains(&address) {
                    continue;
                }
                let url = member.http_endpoint.trim_end_matches('/').to_string();
                if seen_urls.contains(&url) || excluded.contains(&url) {
                    continue;
                }
                let Some(node) = self.registry.get(&url).await else {
                    continue;
                };
                if !node.is_available(now) {
                    continue;
                }
                seen_addresses.insert(address);
                seen_urls.insert(url);
                pool.push(node);
            }
        }

        // 3. Remaining registry nodes. Non-entry pipeline members were
        //    already skipped above and stay out: a pipeline node reachable
        //    only through the topology is not independently selectable.
        let non_entry: HashSet<String> = match self.topology.read().await.as_ref() {
            Some(topology) => topology
                .nodes
                .iter()
                .filter(|m| !m.is_entry())
                .map(|m| m.http_endpoint.trim_end_matches('/').to_string())
                .collect(),
            None => HashSet::new(),
        };
        for node in self.registry.snapshot_all().await {
            if !node.is_available(now) {
                continue;
            }
            if seen_urls.contains(&node.url)
                || excluded.contains(&node.url)
                || non_entry.contains(&node.url)
            {
                continue;
            }
            if let Some(address) = &node.address {
                if !seen_addresses.insert(address.clone()) {
                    continue;
                }
            }
            seen_urls.insert(node.url.clone());
            pool.push(node);
        }

        pool
    }

    /// Assemble and draw one candidate.
    pub async fn select(&self, excluded: &HashSet<String>) -> Option<Node> {
        let pool = self.assemble(excluded).await;
        let mut rng = rand::thread_rng();
        pick_weighted(&pool, &mut rng).cloned()
    }

    /// Take an in-flight slot on `node`, released when the guard drops.
    pub async fn acquire(&self, node: &Node) -> InFlightGuard {
        if node.node_type == NodeType::Relay {
            *self
                .relay_in_flight
                .lock()
                .await
                .entry(node.url.clone())
                .or_insert(0) += 1;
        } else {
            self.registry.acquire_slot(&node.url).await;
        }
        InFlightGuard {
            registry: Arc::clone(&self.registry),
            relay_in_flight: Arc::clone(&self.relay_in_flight),
            url: node.url.clone(),
            is_relay: node.node_type == NodeType::Relay,
        }
    }
}

/// RAII in-flight slot. Dropping releases the slot on every exit path,
/// including cancellation.
pub struct InFlightGuard {
    registry: Arc<NodeRegistry>,
    relay_in_flight: Arc<Mutex<HashMap<String, u32>>>,
    url: String,
    is_relay: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let relay_in_flight = Arc::clone(&self.relay_in_flight);
        let url = std::mem::take(&mut self.url);
        let is_relay = self.is_relay;
        tokio::spawn(async move {
            if is_relay {
                let mut counters = relay_in_flight.lock().await;
                if let Some(count) = counters.get_mut(&url) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        counters.remove(&url);
                    }
                }
            } else {
                registry.release_slot(&url).await;
            }
        });
    }
}
