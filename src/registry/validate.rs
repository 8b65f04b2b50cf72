//! Node URL validation.

use url::{Host, Url};

use crate::error::RegistryError;

/// Validate a node URL for registration.
///
/// Rejects non-http(s) schemes and loopback hosts outright. Private-range
/// IPv4 addresses are rejected unless `allow_private_ips` is set. The result
/// depends only on the URL string and the flag.
pub fn validate_node_url(url: &str, allow_private_ips: bool) -> Result<(), RegistryError> {
    let parsed = Url::parse(url).map_err(|e| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(RegistryError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            });
        }
    }

    let host = parsed.host().ok_or_else(|| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;

    match host {
        Host::Domain(domain) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err(RegistryError::InvalidUrl {
                    url: url.to_string(),
                    reason: "loopback host".to_string(),
                });
            }
        }
        Host::Ipv4(ip) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(RegistryError::InvalidUrl {
                    url: url.to_string(),
                    reason: "loopback host".to_string(),
                });
            }
            if !allow_private_ips && (ip.is_private() || ip.is_link_local()) {
                return Err(RegistryError::InvalidUrl {
                    url: url.to_string(),
                    reason: "private-range address".to_string(),
                });
            }
        }
        Host::Ipv6(ip) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(RegistryError::InvalidUrl {
                    url: url.to_string(),
                    reason: "loopback host".to_string(),
                });
            }
            if !allow_private_ips {
                if let Some(v4) = ip.to_ipv4_mapped() {
                    if v4.is_private() || v4.is_link_local() || v4.is_loopback() {
                        return Err(RegistryError::InvalidUrl {
                            url: url.to_string(),
                            reason: "private-range address".to_string(),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_public_urls() {
        assert!(validate_node_url("http://node-a.example.com:8080", false).is_ok());
        assert!(validate_node_url("https://8.8.8.8", false).is_ok());
    }

    #[test]
    fn test_rejects_loopback() {
        assert!(validate_node_url("http://localhost", false).is_err());
        assert!(validate_node_url("http://localhost", true).is_err());
        assert!(validate_node_url("http://127.0.0.1:9000", false).is_err());
        assert!(validate_node_url("http://0.0.0.0", false).is_err());
        assert!(validate_node_url("http://[::1]:8080", false).is_err());
    }

    #[test]
    fn test_private_ranges_gated_by_flag() {
        for url in [
            "http://10.1.2.3",
            "http://172.16.0.9",
            "http://192.168.0.1",
            "http://169.254.10.10",
        ] {
            assert!(validate_node_url(url, false).is_err(), "{url}");
            assert!(validate_node_url(url, true).is_ok(), "{url}");
        }
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        assert!(validate_node_url("ws://node.example.com", false).is_err());
        assert!(validate_node_url("file:///etc/passwd", false).is_err());
    }

    #[test]
    fn test_is_pure_in_url_and_flag() {
        let url = "http://10.0.0.1";
        assert_eq!(
            validate_node_url(url, false).is_ok(),
            validate_node_url(url, false).is_ok()
        );
        assert_ne!(
            validate_node_url(url, false).is_ok(),
            validate_node_url(url, true).is_ok()
        );
    }
}
