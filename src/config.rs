use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual host configurations
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Plaintext HTTP port (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS port (default: 443, used only when at least one site requires TLS)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Operator contact email (opaque to the proxy, recorded for certificate
    /// tooling)
    pub email: Option<String>,

    /// Directory for persisted certificate material (default: ./certs)
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Per-connection idle timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent connections per listener (default: 1024)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            tls_port: None,
            bind: default_bind_address(),
            email: None,
            cert_dir: default_cert_dir(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl ServerConfig {
    /// Idle timeout applied to every connection wait
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Effective TLS port
    pub fn https_port(&self) -> u16 {
        self.tls_port.unwrap_or(443)
    }
}

/// TLS policy for a site
///
/// `Auto` and `Manual` both mean the site is served over TLS; they differ
/// only in how the operator sources certificate material.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext only
    #[default]
    Off,
    /// TLS with store-managed (self-signed) certificates
    Auto,
    /// TLS with operator-provided certificate files in the cert directory
    Manual,
}

impl TlsMode {
    pub fn required(&self) -> bool {
        !matches!(self, TlsMode::Off)
    }
}

/// Configuration for a single virtual host
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Host name clients use to address this site (no port)
    pub domain: String,

    /// Upstream endpoint as "host:port"
    pub backend: String,

    /// TLS policy (default: off)
    #[serde(default)]
    pub tls: TlsMode,

    /// Allow WebSocket upgrades (default: false)
    #[serde(default)]
    pub websocket: bool,

    /// Rewrite the outbound Host header to the upstream authority instead of
    /// passing the client's Host through (default: false)
    #[serde(default)]
    pub rewrite_host: bool,
}

impl SiteConfig {
    /// Split the `backend` field into (host, port)
    pub fn backend_addr(&self) -> Result<(String, u16), String> {
        let (host, port) = self
            .backend
            .rsplit_once(':')
            .ok_or_else(|| format!("Site '{}': backend must be 'host:port'", self.domain))?;

        let port: u16 = port
            .parse()
            .map_err(|_| format!("Site '{}': invalid backend port '{}'", self.domain, port))?;

        if host.is_empty() {
            return Err(format!("Site '{}': backend host is empty", self.domain));
        }
        if port == 0 {
            return Err(format!(
                "Site '{}': backend port must be non-zero",
                self.domain
            ));
        }

        Ok((host.to_string(), port))
    }

    /// Validate a single site entry
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.is_empty() {
            return Err("Site with empty 'domain' field".to_string());
        }

        if !self
            .domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(format!(
                "Site '{}': domain may contain only ASCII letters, digits, '-' and '.'",
                self.domain
            ));
        }

        self.backend_addr().map(|_| ())
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {}: {}", path.display(), e))?;

        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();

        for site in &self.sites {
            site.validate()?;

            let key = site.domain.to_ascii_lowercase();
            if !seen.insert(key) {
                return Err(format!("Duplicate site domain '{}'", site.domain));
            }
        }

        if self.server.timeout_secs == 0 {
            return Err("'timeout_secs' must be non-zero".to_string());
        }
        if self.server.max_connections == 0 {
            return Err("'max_connections' must be non-zero".to_string());
        }

        Ok(())
    }

    /// True when at least one site is served over TLS
    pub fn has_tls_sites(&self) -> bool {
        self.sites.iter().any(|s| s.tls.required())
    }

    /// Domains of all TLS-requiring sites, in configuration order
    pub fn tls_domains(&self) -> Vec<String> {
        self.sites
            .iter()
            .filter(|s| s.tls.required())
            .map(|s| s.domain.to_ascii_lowercase())
            .collect()
    }
}

// Default value functions
fn default_http_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_cert_dir() -> String {
    "./certs".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml = r#"
[server]
http_port = 8080
tls_port = 8443
bind = "127.0.0.1"
email = "ops@example.test"
cert_dir = "/var/lib/hostgate/certs"
timeout_secs = 15
max_connections = 256

[[sites]]
domain = "app.example.test"
backend = "127.0.0.1:3000"
tls = "auto"
websocket = true

[[sites]]
domain = "static.example.test"
backend = "127.0.0.1:3001"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port(), 8443);
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.sites.len(), 2);

        let app = &config.sites[0];
        assert_eq!(app.tls, TlsMode::Auto);
        assert!(app.tls.required());
        assert!(app.websocket);
        assert_eq!(app.backend_addr().unwrap(), ("127.0.0.1".to_string(), 3000));

        let fileserver = &config.sites[1];
        assert_eq!(fileserver.tls, TlsMode::Off);
        assert!(!fileserver.tls.required());
        assert!(!fileserver.websocket);
        assert!(!fileserver.rewrite_host);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port(), 443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.timeout_secs, 30);
        assert_eq!(config.server.max_connections, 1024);
        assert!(config.sites.is_empty());
        assert!(!config.has_tls_sites());
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let toml = r#"
[[sites]]
domain = "a.test"
backend = "no-port-here"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());

        let toml = r#"
[[sites]]
domain = "a.test"
backend = "127.0.0.1:0"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let toml = r#"
[[sites]]
domain = "a.test"
backend = "127.0.0.1:3000"

[[sites]]
domain = "A.TEST"
backend = "127.0.0.1:3001"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.contains("Duplicate"));
    }

    #[test]
    fn test_invalid_domain_characters_rejected() {
        let toml = r#"
[[sites]]
domain = "bad host"
backend = "127.0.0.1:3000"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_domains_in_order() {
        let toml = r#"
[[sites]]
domain = "plain.test"
backend = "127.0.0.1:1"

[[sites]]
domain = "First.TLS.test"
backend = "127.0.0.1:2"
tls = "manual"

[[sites]]
domain = "second.tls.test"
backend = "127.0.0.1:3"
tls = "auto"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.has_tls_sites());
        assert_eq!(
            config.tls_domains(),
            vec!["first.tls.test".to_string(), "second.tls.test".to_string()]
        );
    }
}
