use std::env;
use std::time::Duration;

use url::Url;

use crate::transport::{ChunkConfig, TransportConfig, TransportError};

pub const DEFAULT_RELAY_URL: &str = "wss://relay.snack.dev/v1";
pub const DEFAULT_CANARY_RELAY_URL: &str = "wss://relay-canary.snack.dev/v1";
pub const DEFAULT_STAGING_RELAY_URL: &str = "wss://relay-staging.snack.dev/v1";
pub const DEFAULT_BUNDLER_URL: &str = "https://bundler.snack.dev";
pub const DEFAULT_PRESENCE_GRACE: Duration = Duration::from_secs(10);

/// Relay endpoints a transport may be pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoints {
    pub default: String,
    pub canary: String,
    pub staging: String,
}

impl Default for RelayEndpoints {
    fn default() -> Self {
        Self {
            default: DEFAULT_RELAY_URL.to_string(),
            canary: DEFAULT_CANARY_RELAY_URL.to_string(),
            staging: DEFAULT_STAGING_RELAY_URL.to_string(),
        }
    }
}

impl RelayEndpoints {
    /// An explicit test transport wins over the experimental override.
    pub fn select(
        &self,
        test_transport: Option<&str>,
        experimental: bool,
    ) -> Result<&str, TransportError> {
        match test_transport {
            Some("staging") => Ok(&self.staging),
            Some("canary") => Ok(&self.canary),
            Some("production") => Ok(&self.default),
            Some(other) => Err(TransportError::UnknownTestTransport(other.to_string())),
            None if experimental => Ok(&self.canary),
            None => Ok(&self.default),
        }
    }
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub relay: RelayEndpoints,
    pub bundler_url: String,
    pub chunk: ChunkConfig,
    pub presence_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayEndpoints::default(),
            bundler_url: DEFAULT_BUNDLER_URL.to_string(),
            chunk: ChunkConfig::default(),
            presence_grace: DEFAULT_PRESENCE_GRACE,
        }
    }
}

impl Config {
    /// Loads configuration from `SNACK_*` environment variables. Invalid
    /// values are logged and replaced by their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay = RelayEndpoints {
            default: parse_ws_url_env("SNACK_RELAY_URL", defaults.relay.default),
            canary: parse_ws_url_env("SNACK_RELAY_CANARY_URL", defaults.relay.canary),
            staging: parse_ws_url_env("SNACK_RELAY_STAGING_URL", defaults.relay.staging),
        };
        let bundler_url = match env::var("SNACK_BUNDLER_URL") {
            Ok(raw) => match Url::parse(raw.trim()) {
                Ok(url) => url.to_string(),
                Err(err) => {
                    tracing::warn!(
                        target = "snack::config",
                        var = "SNACK_BUNDLER_URL",
                        error = %err,
                        "invalid bundler url; using default"
                    );
                    defaults.bundler_url
                }
            },
            Err(_) => defaults.bundler_url,
        };
        let chunk = ChunkConfig {
            max_message_bytes: parse_usize_env(
                "SNACK_RELAY_MAX_MESSAGE_BYTES",
                defaults.chunk.max_message_bytes,
                1024,
            ),
            reassembly_timeout: parse_duration_env(
                "SNACK_CHUNK_TIMEOUT_MS",
                defaults.chunk.reassembly_timeout,
            ),
            ..defaults.chunk
        };
        let presence_grace = parse_duration_env("SNACK_PRESENCE_GRACE_MS", defaults.presence_grace);
        Self {
            relay,
            bundler_url,
            chunk,
            presence_grace,
        }
    }

    /// Transport settings for `address` seeded from this configuration.
    pub fn transport_config(&self, address: &str, device_id: &str) -> TransportConfig {
        let mut config = TransportConfig::new(address, device_id);
        config.relay = self.relay.clone();
        config.chunk = self.chunk;
        config
    }
}

fn parse_ws_url_env(var: &str, default: String) -> String {
    let Ok(raw) = env::var(var) else {
        return default;
    };
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => raw.to_string(),
        Ok(url) => {
            tracing::warn!(
                target = "snack::config",
                var,
                scheme = url.scheme(),
                %default,
                "relay url must use ws or wss; using default"
            );
            default
        }
        Err(err) => {
            tracing::warn!(
                target = "snack::config",
                var,
                error = %err,
                %default,
                "invalid relay url; using default"
            );
            default
        }
    }
}

fn parse_duration_env(var: &str, default: Duration) -> Duration {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(err) => {
                tracing::warn!(
                    target = "snack::config",
                    var,
                    error = %err,
                    default_ms = default.as_millis() as u64,
                    "invalid duration env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                tracing::warn!(
                    target = "snack::config",
                    var,
                    parsed,
                    min,
                    default,
                    "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                tracing::warn!(
                    target = "snack::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
