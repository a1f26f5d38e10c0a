//! Host-based route resolution
//!
//! Maps the canonical request host (Host header or SNI, port stripped,
//! lowercased) to its configured upstream endpoint and per-site policies.

use crate::config::Config;
use std::collections::HashMap;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Resolved routing target for a virtual host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Upstream host (name or address)
    pub upstream_host: String,
    /// Upstream TCP port
    pub upstream_port: u16,
    /// Site is served over TLS
    pub tls_required: bool,
    /// WebSocket upgrades permitted
    pub websocket: bool,
    /// Rewrite the outbound Host header to the upstream authority
    pub rewrite_host: bool,
}

impl Route {
    /// Upstream endpoint formatted as "host:port"
    pub fn upstream_authority(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

/// Immutable host → route snapshot derived from one configuration
///
/// Rebuilt wholesale on reload and swapped atomically; in-flight
/// connections keep the snapshot they captured at accept.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
    default_tls_host: Option<String>,
}

impl RouteTable {
    /// Build a route table from a validated configuration
    pub fn from_config(config: &Config) -> Self {
        let mut routes = HashMap::with_capacity(config.sites.len());
        let mut default_tls_host = None;

        for site in &config.sites {
            let (upstream_host, upstream_port) = match site.backend_addr() {
                Ok(addr) => addr,
                // Validation rejects malformed backends before a table is built
                Err(_) => continue,
            };

            let domain = site.domain.to_ascii_lowercase();
            let tls_required = site.tls.required();

            if tls_required && default_tls_host.is_none() {
                default_tls_host = Some(domain.clone());
            }

            routes.insert(
                domain,
                Route {
                    upstream_host,
                    upstream_port,
                    tls_required,
                    websocket: site.websocket,
                    rewrite_host: site.rewrite_host,
                },
            );
        }

        Self {
            routes,
            default_tls_host,
        }
    }

    /// Resolve a canonical host to its route
    ///
    /// Matching is exact on the lowercased ASCII host; no wildcards.
    pub fn resolve(&self, host: &str) -> Option<&Route> {
        self.routes.get(&host.to_ascii_lowercase())
    }

    /// First TLS-requiring host in configuration order, the deterministic
    /// fallback when a TLS client sends no SNI
    pub fn default_tls_host(&self) -> Option<&str> {
        self.default_tls_host.as_deref()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Canonicalize a raw Host header value: strip any `:port`, validate, and
/// lowercase. Returns `None` for values that cannot name a virtual host.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = raw.split(':').next()?;

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; rejects header injection attempts
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn table(toml: &str) -> RouteTable {
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        RouteTable::from_config(&config)
    }

    #[test]
    fn test_resolve_exact_case_insensitive() {
        let table = table(
            r#"
[[sites]]
domain = "Example.Test"
backend = "127.0.0.1:9001"
websocket = true
"#,
        );

        let route = table.resolve("example.test").unwrap();
        assert_eq!(route.upstream_host, "127.0.0.1");
        assert_eq!(route.upstream_port, 9001);
        assert_eq!(route.upstream_authority(), "127.0.0.1:9001");
        assert!(route.websocket);
        assert!(!route.tls_required);

        assert!(table.resolve("EXAMPLE.TEST").is_some());
        assert!(table.resolve("other.test").is_none());
        // Exact match only, no suffix or wildcard behavior
        assert!(table.resolve("sub.example.test").is_none());
    }

    #[test]
    fn test_default_tls_host_is_first_configured() {
        let table = table(
            r#"
[[sites]]
domain = "plain.test"
backend = "127.0.0.1:9000"

[[sites]]
domain = "B.test"
backend = "127.0.0.1:9001"
tls = "auto"

[[sites]]
domain = "a.test"
backend = "127.0.0.1:9002"
tls = "manual"
"#,
        );

        assert_eq!(table.default_tls_host(), Some("b.test"));
        assert!(table.resolve("a.test").unwrap().tls_required);
        assert!(!table.resolve("plain.test").unwrap().tls_required);
    }

    #[test]
    fn test_empty_table() {
        let table = RouteTable::default();
        assert!(table.is_empty());
        assert!(table.resolve("any.test").is_none());
        assert!(table.default_tls_host().is_none());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(
            normalize_host("Example.Test:8443"),
            Some("example.test".to_string())
        );
        assert_eq!(normalize_host("example.test"), Some("example.test".to_string()));
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host(":80"), None);
        assert_eq!(normalize_host("bad host"), None);
        assert_eq!(normalize_host("evil\r\nhost"), None);
        assert_eq!(normalize_host(&"a".repeat(254)), None);
        assert_eq!(normalize_host(&"a".repeat(253)), Some("a".repeat(253)));
    }
}
