//! Per-worker usage accounting and periodic reporting to the oracle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::oracle::{OracleClient, UsageReport};

#[derive(Debug, Clone)]
struct Aggregate {
    tokens: u64,
    requests: u64,
    total_latency_ms: u64,
    uptime_start: Instant,
    last_recorded: Instant,
}

/// Aggregated per-worker counters, reported to the oracle in batches.
///
/// Aggregates are not reset when a report succeeds; the oracle must treat
/// reports as at-least-once and dedupe on its side.
pub struct UsageTracker {
    aggregates: Mutex<HashMap<String, Aggregate>>,
    stale_after: Duration,
}

impl UsageTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            aggregates: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Record one successful request for `address`.
    pub async fn record(&self, address: &str, tokens: u64, latency_ms: u64) {
        let address = address.to_lowercase();
        let now = Instant::now();
        let mut aggregates = self.aggregates.lock().await;
        let entry = aggregates.entry(address).or_insert_with(|| Aggregate {
            tokens: 0,
            requests: 0,
            total_latency_ms: 0,
            uptime_start: now,
            last_recorded: now,
        });
        entry.tokens += tokens;
        entry.requests += 1;
        entry.total_latency_ms += latency_ms;
        entry.last_recorded = now;
    }

    pub async fn tracked_workers(&self) -> usize {
        self.aggregates.lock().await.len()
    }

    /// Evict stale entries, then build one report per remaining worker.
    async fn build_reports(&self) -> Vec<UsageReport> {
        let now = Instant::now();
        let timestamp = Utc::now().timestamp_millis();
        let mut aggregates = self.aggregates.lock().await;

        aggregates.retain(|address, aggregate| {
            let fresh = now.duration_since(aggregate.last_recorded) < self.stale_after;
            if !fresh {
                tracing::info!(address = %address, "Evicting stale usage aggregate");
            }
            fresh
        });

        aggregates
            .iter()
            .map(|(address, aggregate)| UsageReport {
                wallet: address.clone(),
                tokens_processed: aggregate.tokens,
                request_count: aggregate.requests,
                avg_latency_ms: aggregate.total_latency_ms / aggregate.requests.max(1),
                uptime_seconds: now.duration_since(aggregate.uptime_start).as_secs(),
                timestamp,
                signature: String::new(),
            })
            .collect()
    }

    /// One reporting pass. Per-worker failures are logged and skipped; the
    /// rest of the batch still goes out.
    pub async fn report_cycle(&self, oracle: &OracleClient) {
        for report in self.build_reports().await {
            if let Err(e) = oracle.report_usage(&report).await {
                tracing::warn!(wallet = %report.wallet, "Usage report failed: {e}");
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        oracle: Arc<OracleClient>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.report_cycle(&oracle).await,
                _ = shutdown.changed() => {
                    tracing::debug!("Usage reporter stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};

    #[tokio::test]
    async fn test_record_and_build_reports() {
        let tracker = UsageTracker::new(Duration::from_secs(60));
        tracker.record("0xAAA", 100, 50).await;
        tracker.record("0xaaa", 50, 150).await;

        let reports = tracker.build_reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].wallet, "0xaaa");
        assert_eq!(reports[0].tokens_processed, 150);
        assert_eq!(reports[0].request_count, 2);
        assert_eq!(reports[0].avg_latency_ms, 100);
    }

    #[tokio::test]
    async fn test_stale_aggregates_evicted() {
        let tracker = UsageTracker::new(Duration::from_millis(50));
        tracker.record("0xaaa", 10, 5).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        tracker.record("0xbbb", 10, 5).await;

        let reports = tracker.build_reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].wallet, "0xbbb");
    }

    #[tokio::test]
    async fn test_aggregates_survive_report_failure_and_success() {
        // Oracle stub that records received wallets and always accepts.
        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let state = Arc::clone(&received);
        let router = Router::new().route(
            "/api/metrics",
            post(
                |State(state): State<Arc<Mutex<Vec<String>>>>,
                 Json(body): Json<serde_json::Value>| async move {
                    state
                        .lock()
                        .await
                        .push(body["wallet"].as_str().unwrap_or_default().to_string());
                    Json(serde_json::json!({"ok": true}))
                },
            ),
        )
        .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let oracle = OracleClient::new(&format!("http://{addr}"));

        let tracker = UsageTracker::new(Duration::from_secs(60));
        tracker.record("0xaaa", 100, 10).await;

        tracker.report_cycle(&oracle).await;
        tracker.report_cycle(&oracle).await;

        // Not reset on success: both cycles reported the same aggregate.
        assert_eq!(received.lock().await.len(), 2);
        assert_eq!(tracker.tracked_workers().await, 1);
    }
}
