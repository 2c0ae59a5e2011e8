//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: AURA_, sections split on `__`)
//! 2. The config file passed to [`Config::load_from`] (default `./config.toml`)
//! 3. Default values
//!
//! Every section is a typed struct validated at load; unknown keys are a
//! startup error.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Gateway front-end configuration
    #[serde(default)]
    pub api_gateway: ApiGatewayConfig,

    /// Per-plugin enable flags and parameters
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Keys, token TTLs and session lifetimes
    #[serde(default)]
    pub security: SecurityConfig,

    /// Encrypted log store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Tracing and log-consumer settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// In-process message bus settings
    #[serde(default)]
    pub bus: BusConfig,
}

/// Gateway listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiGatewayConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// TLS settings (terminated by the deployment when absent)
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Unary request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Stream idle timeout in seconds
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Local socket adapter settings
    #[serde(default)]
    pub ipc: IpcConfig,
}

impl Default for ApiGatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: None,
            request_timeout_secs: default_request_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            body_limit_mb: default_body_limit_mb(),
            ipc: IpcConfig::default(),
        }
    }
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain
    pub cert_path: PathBuf,

    /// Path to the PEM private key
    pub key_path: PathBuf,
}

/// IPC (Unix domain socket) adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpcConfig {
    /// Enable the local socket adapter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Socket path
    #[serde(default = "default_ipc_socket")]
    pub socket_path: PathBuf,

    /// Require bearer auth in addition to the peer-uid check
    #[serde(default = "default_true")]
    pub require_bearer: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            socket_path: default_ipc_socket(),
            require_bearer: true,
        }
    }
}

/// Per-plugin enable flags and parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Encryption plugin
    #[serde(default = "default_true")]
    pub encryption_enabled: bool,

    /// Auth plugin
    #[serde(default = "default_true")]
    pub auth_enabled: bool,

    /// Validation plugin
    #[serde(default = "default_true")]
    pub validation_enabled: bool,

    /// Rate limiting parameters
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            auth_enabled: true,
            validation_enabled: true,
            rate_limiting: RateLimitConfig::default(),
        }
    }
}

/// Token-bucket rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Enable the rate-limit plugin
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sustained requests per minute per bucket
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Additional burst capacity above the sustained rate
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
        }
    }
}

/// Keys, token TTLs and session lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// JWT signing algorithm (HS256 or EdDSA)
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,

    /// HS256 signing secret; for EdDSA, set `jwt_key_path` instead
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Path to the EdDSA PEM keypair
    #[serde(default)]
    pub jwt_key_path: Option<PathBuf>,

    /// Issuer claim to mint and validate
    #[serde(default)]
    pub issuer: Option<String>,

    /// Audience claim to mint and validate
    #[serde(default)]
    pub audience: Option<String>,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,

    /// Proactive refresh window before expiry, in seconds
    #[serde(default = "default_pre_refresh_window")]
    pub pre_refresh_window_secs: u64,

    /// Tolerated clock skew in seconds
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Encryption session settings
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_algorithm: default_jwt_algorithm(),
            jwt_secret: None,
            jwt_key_path: None,
            issuer: None,
            audience: None,
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            pre_refresh_window_secs: default_pre_refresh_window(),
            clock_skew_secs: default_clock_skew(),
            session: SessionConfig::default(),
        }
    }
}

/// Encryption session lifetimes and failure policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle timeout in seconds
    #[serde(default = "default_session_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Absolute maximum lifetime in seconds
    #[serde(default = "default_session_max_ttl")]
    pub max_ttl_secs: u64,

    /// Decrypt failures tolerated before the session is invalidated
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sweep interval for expired sessions, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-session LRU of recently seen nonces; 0 disables replay tracking
    #[serde(default)]
    pub nonce_replay_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_session_idle_ttl(),
            max_ttl_secs: default_session_max_ttl(),
            failure_threshold: default_failure_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            nonce_replay_window: 0,
        }
    }
}

/// Encrypted log store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite file path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Hex-encoded 32-byte AEAD key sealing event payloads; generated and
    /// logged at startup when absent (dev only)
    #[serde(default)]
    pub crypto_key: Option<String>,

    /// WAL auto-checkpoint threshold in pages
    #[serde(default = "default_wal_autocheckpoint")]
    pub wal_autocheckpoint: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            crypto_key: None,
            wal_autocheckpoint: default_wal_autocheckpoint(),
        }
    }
}

/// Tracing and log-consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted tracing output
    #[serde(default)]
    pub json: bool,

    /// Log-consumer batch size threshold
    #[serde(default = "default_log_batch_size")]
    pub batch_size: usize,

    /// Log-consumer flush interval in milliseconds
    #[serde(default = "default_log_flush_ms")]
    pub flush_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            batch_size: default_log_batch_size(),
            flush_interval_ms: default_log_flush_ms(),
        }
    }
}

/// In-process message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Per-subscriber bounded queue depth
    #[serde(default = "default_bus_queue_depth")]
    pub queue_depth: usize,

    /// Request/reply timeout in seconds
    #[serde(default = "default_bus_request_timeout")]
    pub request_timeout_secs: u64,

    /// Keep-alive interval for reply streams, in seconds
    #[serde(default = "default_bus_keepalive")]
    pub stream_keepalive_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_bus_queue_depth(),
            request_timeout_secs: default_bus_request_timeout(),
            stream_keepalive_secs: default_bus_keepalive(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8771
}

fn default_request_timeout() -> u64 {
    30
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_body_limit_mb() -> usize {
    10
}

fn default_ipc_socket() -> PathBuf {
    PathBuf::from("/tmp/aura-gateway.sock")
}

fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    100
}

fn default_burst() -> u32 {
    20
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_ttl() -> u64 {
    15 * 60
}

fn default_refresh_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_pre_refresh_window() -> u64 {
    2 * 60
}

fn default_clock_skew() -> u64 {
    60
}

fn default_session_idle_ttl() -> u64 {
    30 * 60
}

fn default_session_max_ttl() -> u64 {
    24 * 60 * 60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./aura-logs.db")
}

fn default_wal_autocheckpoint() -> u32 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_batch_size() -> usize {
    100
}

fn default_log_flush_ms() -> u64 {
    2000
}

fn default_bus_queue_depth() -> usize {
    256
}

fn default_bus_request_timeout() -> u64 {
    30
}

fn default_bus_keepalive() -> u64 {
    15
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_gateway: ApiGatewayConfig::default(),
            plugins: PluginsConfig::default(),
            security: SecurityConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `./config.toml` plus environment overrides
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific file plus environment overrides
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    fn figment(path: &std::path::Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AURA_").split("__"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api_gateway.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.api_gateway.stream_idle_timeout_secs)
    }
}

/// Configuration store with dotted-path lookup and hot-reload notification
///
/// Holds the typed [`Config`] plus the merged value tree so callers can
/// resolve paths like `"api_gateway.rate_limiting.requests_per_minute"`
/// without knowing the section structs. Subscribers receive the new typed
/// config through a watch channel and re-read under their own locks.
pub struct ConfigStore {
    source: Option<PathBuf>,
    tx: watch::Sender<Config>,
}

impl ConfigStore {
    /// Create a store over an already-loaded config with no file source
    pub fn fixed(config: Config) -> Self {
        let (tx, _) = watch::channel(config);
        Self { source: None, tx }
    }

    /// Create a store backed by a config file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        let (tx, _) = watch::channel(config);
        Ok(Self {
            source: Some(path),
            tx,
        })
    }

    /// Current configuration snapshot
    pub fn current(&self) -> Config {
        self.tx.borrow().clone()
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.tx.subscribe()
    }

    /// Dotted-path lookup over the merged value tree
    ///
    /// Returns `None` when the path does not resolve. Defaults are part of
    /// the tree, so a path present only in the default layer still resolves.
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let tree = serde_json::to_value(self.current()).ok()?;
        let mut node = &tree;
        for segment in path.split('.') {
            node = node.get(segment)?;
        }
        Some(node.clone())
    }

    /// Watch the source file for changes, emitting new configs on the
    /// subscription channel until cancelled
    ///
    /// Polls the file's modification time; a failed re-parse keeps the
    /// previous config and logs a warning.
    pub fn spawn_watcher(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let Some(path) = self.source.clone() else {
            return;
        };
        tokio::spawn(async move {
            let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Config watcher stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                if mtime != last_mtime {
                    last_mtime = mtime;
                    match Config::load_from(&path) {
                        Ok(config) => {
                            tracing::info!(path = %path.display(), "Configuration reloaded");
                            let _ = self.tx.send(config);
                        }
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Config reload failed, keeping previous");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_gateway.port, 8771);
        assert_eq!(config.plugins.rate_limiting.requests_per_minute, 100);
        assert_eq!(config.plugins.rate_limiting.burst, 20);
        assert_eq!(config.security.access_token_ttl_secs, 15 * 60);
        assert_eq!(config.security.refresh_token_ttl_secs, 7 * 24 * 60 * 60);
        assert_eq!(config.security.pre_refresh_window_secs, 120);
        assert_eq!(config.security.session.idle_ttl_secs, 30 * 60);
        assert_eq!(config.security.session.max_ttl_secs, 24 * 60 * 60);
        assert_eq!(config.database.wal_autocheckpoint, 1000);
    }

    #[test]
    fn test_dotted_path_lookup() {
        let store = ConfigStore::fixed(Config::default());
        let rpm = store
            .get_path("plugins.rate_limiting.requests_per_minute")
            .unwrap();
        assert_eq!(rpm, serde_json::json!(100));
        assert!(store.get_path("plugins.rate_limiting.nope").is_none());
        assert!(store.get_path("no.such.section").is_none());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("[api_gateway]\nbogus_key = 1\n"))
            .extract::<Config>()
            .unwrap_err();
        assert!(err.to_string().contains("bogus_key"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                "[plugins.rate_limiting]\nrequests_per_minute = 10\nburst = 2\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(config.plugins.rate_limiting.requests_per_minute, 10);
        assert_eq!(config.plugins.rate_limiting.burst, 2);
        // untouched sections keep defaults
        assert_eq!(config.api_gateway.port, 8771);
    }
}
