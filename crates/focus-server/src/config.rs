//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - The first TOML file found in [`CONFIG_PATHS`]
//! - Environment variables (`FOCUS_PORT`, `FOCUS_AUTH__JWT_SECRET`, ...)

use anyhow::{Context, Result};
use focus_auth::CredentialManager;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Files searched for configuration, in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "focus.toml",
    "/etc/focus/focus.toml",
    "~/.config/focus/focus.toml",
];

/// Signing secret shipped as the default. Never use it in production.
pub const DEFAULT_JWT_SECRET: &str = "your-secret-key-change-in-production";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Credential configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Delivery queue configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for signing credentials.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Access credential lifetime in seconds.
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,

    /// Refresh credential lifetime in seconds.
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,

    /// Cookie carrying the access credential.
    #[serde(default = "default_access_cookie")]
    pub access_cookie: String,

    /// Cookie carrying the refresh credential.
    #[serde(default = "default_refresh_cookie")]
    pub refresh_cookie: String,

    /// Mark credential cookies `Secure`.
    #[serde(default)]
    pub secure_cookies: bool,

    /// Identities known to the in-process user directory.
    #[serde(default)]
    pub users: Vec<String>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Liveness sweep interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Read deadline in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// Per-write deadline in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Delivery queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Events buffered before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_jwt_secret() -> String {
    DEFAULT_JWT_SECRET.to_string()
}

fn default_access_ttl() -> u64 {
    900 // 15 minutes
}

fn default_refresh_ttl() -> u64 {
    604_800 // 7 days
}

fn default_access_cookie() -> String {
    focus_auth::DEFAULT_ACCESS_COOKIE.to_string()
}

fn default_refresh_cookie() -> String {
    "refresh_token".to_string()
}

fn default_ws_path() -> String {
    "/api/v1/ws".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_queue_capacity() -> usize {
    256
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            delivery: DeliveryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            access_cookie: default_access_cookie(),
            refresh_cookie: default_refresh_cookie(),
            secure_cookies: false,
            users: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl AuthConfig {
    /// Whether the shipped default secret is still in use.
    #[must_use]
    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }

    /// Build the credential manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty or a lifetime is zero.
    pub fn credential_manager(&self) -> Result<CredentialManager> {
        CredentialManager::new(
            self.jwt_secret.as_bytes(),
            Duration::from_secs(self.access_ttl_secs),
            Duration::from_secs(self.refresh_ttl_secs),
        )
        .context("Invalid [auth] configuration")
    }
}

/// Environment overrides: `FOCUS_` prefix, `__` between nested keys.
fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix("FOCUS")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("auth.users")
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(::config::File::new(
                    expanded.as_ref(),
                    ::config::FileFormat::Toml,
                ));
                break;
            }
        }

        builder = builder.add_source(environment());

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Delivery engine settings.
    #[must_use]
    pub fn delivery_config(&self) -> focus_core::DeliveryConfig {
        focus_core::DeliveryConfig {
            queue_capacity: self.delivery.queue_capacity,
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            ping_interval: Duration::from_millis(self.heartbeat.interval_ms),
        }
    }

    /// Connection lifecycle settings.
    #[must_use]
    pub fn lifecycle_config(&self) -> focus_core::LifecycleConfig {
        focus_core::LifecycleConfig {
            read_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
        }
    }
}
