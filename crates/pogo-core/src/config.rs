use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::store::RedisConfig;

/// Main configuration structure for pogo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // POGO_CONFIG wins over the default locations
        if let Ok(config_path) = std::env::var("POGO_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = [
            "./config/pogo.toml",
            "/etc/pogo/pogo.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.server.port == 0 {
            return Err(Error::Config("Invalid server port".to_string()));
        }

        if self.dispatch.default_timeout_secs == 0 {
            return Err(Error::Config(
                "dispatch.default_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.workers.reconnect_grace_secs == 0 {
            return Err(Error::Config(
                "workers.reconnect_grace_secs must be > 0".to_string(),
            ));
        }

        if self.workers.tls.enabled {
            self.workers.tls.validate()?;
        }

        Ok(())
    }
}

/// HTTP front-end bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Override from a `host:port` string (`--bind`)
    pub fn apply_bind(&mut self, bind: &str) -> Result<(), crate::Error> {
        let (host, port) = bind
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::Config(format!("Invalid bind address: {}", bind)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid bind port: {}", bind)))?;
        self.host = host.to_string();
        self.port = port;
        Ok(())
    }
}

/// Which coordination store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; single-node only
    Memory,

    /// Redis-backed store
    Redis,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Redis
    }
}

/// Coordination store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub redis: RedisConfig,
}

/// Worker fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Worker addresses the dispatcher connects to
    #[serde(default)]
    pub addresses: Vec<String>,

    /// How long a dropped worker may reconnect before its tasks are failed
    #[serde(default = "default_reconnect_grace")]
    pub reconnect_grace_secs: u64,

    /// Liveness ping interval
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// TLS material for the worker channel
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_reconnect_grace() -> u64 {
    30
}

fn default_ping_interval() -> u64 {
    10
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            reconnect_grace_secs: default_reconnect_grace(),
            ping_interval_secs: default_ping_interval(),
            tls: TlsConfig::default(),
        }
    }
}

/// TLS configuration for worker sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Use TLS for worker sessions; plain TCP is for tests only
    #[serde(default)]
    pub enabled: bool,

    /// CA bundle validating worker certificates
    #[serde(default)]
    pub ca_file: Option<String>,

    /// Dispatcher client certificate
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Dispatcher client key
    #[serde(default)]
    pub key_file: Option<String>,

    /// Accepted worker certificate SHA-256 fingerprints (hex)
    #[serde(default)]
    pub pinned_sha256: Vec<String>,
}

impl TlsConfig {
    /// Validate TLS configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.cert_file.is_none() || self.key_file.is_none() {
            return Err(Error::Config(
                "workers.tls requires cert_file and key_file".to_string(),
            ));
        }
        if self.ca_file.is_none() && self.pinned_sha256.is_empty() {
            return Err(Error::Config(
                "workers.tls requires ca_file or pinned_sha256".to_string(),
            ));
        }
        for fp in &self.pinned_sha256 {
            if fp.len() != 64 || !fp.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!(
                    "pinned_sha256 entry is not a hex SHA-256: {}",
                    fp
                )));
            }
        }
        Ok(())
    }
}

/// Dispatch policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-host timeout applied when the spec omits one
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// Multiplier on the per-host timeout for the abandon safety timer
    #[serde(default = "default_abandon_factor")]
    pub abandon_factor: u32,
}

fn default_timeout() -> u64 {
    crate::job::DEFAULT_TIMEOUT_SECS
}

fn default_abandon_factor() -> u32 {
    2
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            abandon_factor: default_abandon_factor(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Effective level: `POGO_LOG_LEVEL` overrides the configured value
    pub fn effective_level(&self) -> String {
        std::env::var("POGO_LOG_LEVEL").unwrap_or_else(|_| self.level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
[server]
port = 9000

[store]
backend = "memory"

[workers]
addresses = ["worker1:8601", "worker2:8601"]
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.workers.addresses.len(), 2);
        assert_eq!(config.workers.reconnect_grace_secs, 30);
    }

    #[test]
    fn test_apply_bind() {
        let mut server = ServerConfig::default();
        server.apply_bind("127.0.0.1:8700").unwrap();
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 8700);

        assert!(server.apply_bind("no-port").is_err());
    }

    #[test]
    fn test_tls_validation() {
        let tls = TlsConfig {
            enabled: true,
            ca_file: None,
            cert_file: Some("cert.pem".into()),
            key_file: Some("key.pem".into()),
            pinned_sha256: vec!["zz".into()],
        };
        assert!(tls.validate().is_err());

        let tls = TlsConfig {
            pinned_sha256: vec!["a".repeat(64)],
            ..tls
        };
        assert!(tls.validate().is_ok());
    }
}
