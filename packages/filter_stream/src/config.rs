use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, RetryPolicy};

// =============================================================================
// File config (figment-deserialized from defaults / config file / env vars)
// =============================================================================
//
//   config.toml:     [retry]
//                    max_attempts = 3
//
//   env var:         FILTER_STREAM_RETRY__MAX_ATTEMPTS=3   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub retry: RetryFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Where the stream server lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Unplanned-disconnect recovery (`[retry]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryFileConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

/// Per-attempt knobs (`[connection]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    /// Abort a connection attempt that has not opened after this many seconds.
    /// Unset means rely on the transport's own timeout.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_scheme() -> String {
    "ws".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY.as_secs()
}

/// Build a figment that layers: defaults → config file (if any) → FILTER_STREAM_* env vars.
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("FILTER_STREAM_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

/// Address of the stream server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::from_file(&ServerFileConfig::default())
    }
}

impl ServerAddress {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            scheme: fc.scheme.clone(),
            host: fc.host.clone(),
            port: fc.port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// `<scheme>://<host>:<port>/<encoded-filter-set>`
    pub fn connection_url(&self, encoded_filters: &str) -> String {
        format!("{}/{}", self.base_url(), encoded_filters)
    }
}

/// Everything a [`crate::StreamClient`] needs to run.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub address: ServerAddress,
    pub retry: RetryPolicy,
    pub connect_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            address: ServerAddress::from_file(&fc.server),
            retry: RetryPolicy {
                max_attempts: fc.retry.max_attempts,
                delay: Duration::from_secs(fc.retry.delay_secs),
            },
            connect_timeout: fc.connection.connect_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Resolve configuration from defaults, an optional TOML file and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, figment::Error> {
        let fc: FileConfig = load_config(config_file).extract()?;
        Ok(Self::from_file(&fc))
    }
}
