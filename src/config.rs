//! Gateway configuration loaded from the environment.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Tier limits applied to client requests.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Max tokens a free-tier request may ask for.
    pub free_max_tokens: u32,
    /// Max tokens a pro-tier request may ask for.
    pub pro_max_tokens: u32,
    /// Requests per rate-limit window on the free tier.
    pub free_requests_per_window: u32,
    /// Length of the free-tier rate-limit window.
    pub free_window: Duration,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            free_max_tokens: 512,
            pro_max_tokens: 4096,
            free_requests_per_window: 20,
            free_window: Duration::from_secs(60),
        }
    }
}

/// Timeouts and cadences for the background loops and per-request deadlines.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Health probe request timeout.
    pub health_probe: Duration,
    /// Health probe loop cadence.
    pub health_interval: Duration,
    /// Oracle discovery loop cadence.
    pub discovery_interval: Duration,
    /// Per-attempt deadline (unary and streaming).
    pub attempt: Duration,
    /// Rolling inactivity deadline for relay streams.
    pub stream_inactivity: Duration,
    /// Relay auth handshake deadline.
    pub auth_handshake: Duration,
    /// Relay ping cadence.
    pub worker_ping: Duration,
    /// Usage aggregates older than this are evicted before reporting.
    pub stale_aggregate: Duration,
    /// Usage report loop cadence.
    pub usage_report: Duration,
    /// Comment heartbeat cadence on client-facing SSE streams.
    pub sse_heartbeat: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_probe: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(30),
            attempt: Duration::from_secs(120),
            stream_inactivity: Duration::from_secs(120),
            auth_handshake: Duration::from_secs(10),
            worker_ping: Duration::from_secs(30),
            stale_aggregate: Duration::from_secs(60),
            usage_report: Duration::from_secs(10),
            sse_heartbeat: Duration::from_secs(15),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Oracle base URL; enables discovery and usage reporting when set.
    pub oracle_url: Option<String>,
    /// Seed node URLs upserted at boot.
    pub static_node_urls: Vec<String>,
    /// Skip the private-range rejection in node URL validation.
    pub allow_private_ips: bool,
    /// Model id used for topology queries and as the default protocol model.
    pub default_model: String,
    /// Bearer tokens granting the free tier. Issuance happens elsewhere;
    /// the gateway only recognizes them. Empty together with
    /// `pro_api_tokens` means the gateway runs open (everyone is pro).
    pub free_api_tokens: Vec<String>,
    /// Bearer tokens granting the pro tier.
    pub pro_api_tokens: Vec<String>,
    /// Model ids a free-tier caller may not request.
    pub pro_only_models: Vec<String>,
    pub tiers: TierConfig,
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// At least one of `ORACLE_URL` / `STATIC_NODE_URLS` must be present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let oracle_url = env::var("ORACLE_URL")
            .ok()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());

        let static_node_urls: Vec<String> = parse_env_list("STATIC_NODE_URLS")
            .into_iter()
            .map(|s| s.trim_end_matches('/').to_string())
            .collect();

        if oracle_url.is_none() && static_node_urls.is_empty() {
            return Err(ConfigError::MissingNodeSource);
        }

        let allow_private_ips = env::var("ALLOW_PRIVATE_IPS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let default_model =
            env::var("DEFAULT_MODEL").unwrap_or_else(|_| "llama-3.1-70b".to_string());

        let free_api_tokens = parse_env_list("FREE_API_TOKENS");
        let pro_api_tokens = parse_env_list("PRO_API_TOKENS");
        let pro_only_models = parse_env_list("PRO_ONLY_MODELS");

        let mut tiers = TierConfig::default();
        if let Some(v) = parse_env_u32("FREE_MAX_TOKENS")? {
            tiers.free_max_tokens = v;
        }
        if let Some(v) = parse_env_u32("PRO_MAX_TOKENS")? {
            tiers.pro_max_tokens = v;
        }
        if let Some(v) = parse_env_u32("FREE_REQUESTS_PER_WINDOW")? {
            tiers.free_requests_per_window = v;
        }
        if let Some(v) = parse_env_u32("FREE_WINDOW_SECS")? {
            tiers.free_window = Duration::from_secs(v as u64);
        }

        let mut timeouts = TimeoutConfig::default();
        if let Some(v) = parse_env_u32("MESHGATE_ATTEMPT_TIMEOUT_SECS")? {
            timeouts.attempt = Duration::from_secs(v as u64);
            timeouts.stream_inactivity = Duration::from_secs(v as u64);
        }
        if let Some(v) = parse_env_u32("MESHGATE_DISCOVERY_INTERVAL_SECS")? {
            timeouts.discovery_interval = Duration::from_secs(v as u64);
        }
        if let Some(v) = parse_env_u32("MESHGATE_HEALTH_INTERVAL_SECS")? {
            timeouts.health_interval = Duration::from_secs(v as u64);
        }

        Ok(Self {
            oracle_url,
            static_node_urls,
            allow_private_ips,
            default_model,
            free_api_tokens,
            pro_api_tokens,
            pro_only_models,
            tiers,
            timeouts,
        })
    }
}

fn parse_env_list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let t = TimeoutConfig::default();
        assert_eq!(t.attempt, Duration::from_secs(120));
        assert_eq!(t.health_probe, Duration::from_secs(5));
        assert_eq!(t.sse_heartbeat, Duration::from_secs(15));
    }

    #[test]
    fn test_tier_defaults() {
        let t = TierConfig::default();
        assert!(t.pro_max_tokens > t.free_max_tokens);
    }
}
