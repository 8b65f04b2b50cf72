//! Client authentication and tier enforcement.
//!
//! Token issuance lives outside the gateway; this layer only recognizes
//! presented bearer tokens and maps them to a tier. With no tokens
//! configured at all the gateway runs open and every caller gets the pro
//! tier. Free-tier callers are additionally bounded by a per-token
//! sliding request counter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::GatewayError;

/// Caller tier resolved from the bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }
}

/// Resolves callers to tiers and enforces the free-tier request budget.
pub struct ClientAuth {
    free_tokens: HashSet<String>,
    pro_tokens: HashSet<String>,
    limiter: SlidingCounter,
}

impl ClientAuth {
    pub fn new(config: &Config) -> Self {
        Self {
            free_tokens: config.free_api_tokens.iter().cloned().collect(),
            pro_tokens: config.pro_api_tokens.iter().cloned().collect(),
            limiter: SlidingCounter::new(
                config.tiers.free_requests_per_window,
                config.tiers.free_window,
            ),
        }
    }

    /// No tokens configured: the gateway runs open.
    fn is_open(&self) -> bool {
        self.free_tokens.is_empty() && self.pro_tokens.is_empty()
    }

    /// Resolve the caller's tier from the Authorization header. Returns
    /// the tier and the token, which doubles as the rate-limit key.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(Tier, String), GatewayError> {
        if self.is_open() {
            return Ok((Tier::Pro, String::new()));
        }
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(GatewayError::Unauthorized)?;

        if self.pro_tokens.contains(token) {
            Ok((Tier::Pro, token.to_string()))
        } else if self.free_tokens.contains(token) {
            Ok((Tier::Free, token.to_string()))
        } else {
            Err(GatewayError::Unauthorized)
        }
    }

    /// Enforce the free tier's requests-per-window budget. Pro callers
    /// pass unconditionally.
    pub async fn check_rate(&self, tier: Tier, token: &str) -> Result<(), GatewayError> {
        if tier == Tier::Pro {
            return Ok(());
        }
        if self.limiter.allow(token).await {
            Ok(())
        } else {
            Err(GatewayError::RateLimited)
        }
    }
}

/// Sliding request counter, keyed per token. Timestamps older than the
/// window are pruned on every check.
struct SlidingCounter {
    max_requests: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingCounter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let entries = hits.entry(key.to_string()).or_default();
        while entries
            .front()
            .map(|t| now.duration_since(*t) >= self.window)
            .unwrap_or(false)
        {
            entries.pop_front();
        }
        if entries.len() as u32 >= self.max_requests {
            return false;
        }
        entries.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TierConfig, TimeoutConfig};
    use axum::http::HeaderValue;

    fn config_with_tokens(free: &[&str], pro: &[&str]) -> Config {
        Config {
            oracle_url: None,
            static_node_urls: vec!["http://node-a.example.com".to_string()],
            allow_private_ips: false,
            default_model: "llama-3.1-70b".to_string(),
            free_api_tokens: free.iter().map(|s| s.to_string()).collect(),
            pro_api_tokens: pro.iter().map(|s| s.to_string()).collect(),
            pro_only_models: vec![],
            tiers: TierConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_open_mode_grants_pro() {
        let auth = ClientAuth::new(&config_with_tokens(&[], &[]));
        let (tier, _) = auth.authorize(&HeaderMap::new()).unwrap();
        assert_eq!(tier, Tier::Pro);
    }

    #[test]
    fn test_missing_token_is_unauthorized() {
        let auth = ClientAuth::new(&config_with_tokens(&["free-1"], &["pro-1"]));
        assert!(matches!(
            auth.authorize(&HeaderMap::new()),
            Err(GatewayError::Unauthorized)
        ));
    }

    #[test]
    fn test_unknown_token_is_unauthorized() {
        let auth = ClientAuth::new(&config_with_tokens(&["free-1"], &["pro-1"]));
        assert!(matches!(
            auth.authorize(&bearer("who-dis")),
            Err(GatewayError::Unauthorized)
        ));
    }

    #[test]
    fn test_tokens_resolve_to_their_tier() {
        let auth = ClientAuth::new(&config_with_tokens(&["free-1"], &["pro-1"]));
        let (tier, token) = auth.authorize(&bearer("free-1")).unwrap();
        assert_eq!(tier, Tier::Free);
        assert_eq!(token, "free-1");

        let (tier, _) = auth.authorize(&bearer("pro-1")).unwrap();
        assert_eq!(tier, Tier::Pro);
    }

    #[tokio::test]
    async fn test_free_tier_rate_limit() {
        let mut config = config_with_tokens(&["free-1"], &[]);
        config.tiers.free_requests_per_window = 3;
        config.tiers.free_window = Duration::from_secs(60);
        let auth = ClientAuth::new(&config);

        for _ in 0..3 {
            auth.check_rate(Tier::Free, "free-1").await.unwrap();
        }
        assert!(matches!(
            auth.check_rate(Tier::Free, "free-1").await,
            Err(GatewayError::RateLimited)
        ));
        // Other tokens have their own budget.
        auth.check_rate(Tier::Free, "free-other").await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_window_slides() {
        let mut config = config_with_tokens(&["free-1"], &[]);
        config.tiers.free_requests_per_window = 1;
        config.tiers.free_window = Duration::from_millis(40);
        let auth = ClientAuth::new(&config);

        auth.check_rate(Tier::Free, "free-1").await.unwrap();
        assert!(auth.check_rate(Tier::Free, "free-1").await.is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;
        auth.check_rate(Tier::Free, "free-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_pro_tier_is_not_rate_limited() {
        let mut config = config_with_tokens(&[], &["pro-1"]);
        config.tiers.free_requests_per_window = 1;
        let auth = ClientAuth::new(&config);

        for _ in 0..5 {
            auth.check_rate(Tier::Pro, "pro-1").await.unwrap();
        }
    }
}
