//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default coordination service endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://interval.com/websocket";

pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_UNRESPONSIVE_TIMEOUT_MS: u64 = 3 * 60 * 1_000;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Options consumed by the connection layer.
///
/// Durations are stored as milliseconds so the struct round-trips through
/// JSON/env without custom serializers. A zero value means "use the default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the coordination service.
    pub endpoint: String,
    /// API key sent as `x-api-key` on every connect.
    pub api_key: Option<String>,
    /// Delay between reconnect attempts and between resend rounds.
    pub retry_interval_ms: u64,
    /// Keepalive ping interval.
    pub ping_interval_ms: u64,
    /// Maximum time without a successful ping before the socket is replaced.
    pub close_unresponsive_connection_timeout_ms: u64,
    /// How long a single ping waits for its pong.
    pub ping_timeout_ms: u64,
    /// How long a single outbound call waits for its reply.
    pub call_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            close_unresponsive_connection_timeout_ms: DEFAULT_UNRESPONSIVE_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

const fn or_default(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}

impl ClientConfig {
    /// Create a config for the given endpoint with default timings.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub const fn with_unresponsive_timeout(mut self, timeout: Duration) -> Self {
        self.close_unresponsive_connection_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(or_default(self.retry_interval_ms, DEFAULT_RETRY_INTERVAL_MS))
    }

    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(or_default(self.ping_interval_ms, DEFAULT_PING_INTERVAL_MS))
    }

    #[must_use]
    pub const fn unresponsive_timeout(&self) -> Duration {
        Duration::from_millis(or_default(
            self.close_unresponsive_connection_timeout_ms,
            DEFAULT_UNRESPONSIVE_TIMEOUT_MS,
        ))
    }

    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(or_default(self.ping_timeout_ms, DEFAULT_PING_TIMEOUT_MS))
    }

    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(or_default(self.call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS))
    }

    /// Apply `HOSTLINK_*` environment overrides on top of this config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("HOSTLINK_ENDPOINT") {
            let trimmed = endpoint.trim();
            if !trimmed.is_empty() {
                self.endpoint = trimmed.to_string();
            }
        }
        if let Some(api_key) = lookup("HOSTLINK_API_KEY") {
            let trimmed = api_key.trim();
            if !trimmed.is_empty() {
                self.api_key = Some(trimmed.to_string());
            }
        }

        let numeric = [
            ("HOSTLINK_RETRY_INTERVAL_MS", &mut self.retry_interval_ms),
            ("HOSTLINK_PING_INTERVAL_MS", &mut self.ping_interval_ms),
            (
                "HOSTLINK_UNRESPONSIVE_TIMEOUT_MS",
                &mut self.close_unresponsive_connection_timeout_ms,
            ),
        ];
        for (key, slot) in numeric {
            let Some(raw) = lookup(key) else {
                continue;
            };
            match raw.trim().parse::<u64>() {
                Ok(value) => *slot = value,
                Err(e) => tracing::warn!("ignoring invalid {key}={raw:?}: {e}"),
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.retry_interval(), Duration::from_secs(3));
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.unresponsive_timeout(), Duration::from_secs(180));
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"retry_interval_ms": 0, "ping_interval_ms": 0}"#).unwrap();
        assert_eq!(config.retry_interval(), Duration::from_secs(3));
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_builder_setters() {
        let config = ClientConfig::new("ws://localhost:3000/websocket")
            .with_api_key("live_key")
            .with_retry_interval(Duration::from_millis(250))
            .with_unresponsive_timeout(Duration::from_secs(2));
        assert_eq!(config.api_key.as_deref(), Some("live_key"));
        assert_eq!(config.retry_interval(), Duration::from_millis(250));
        assert_eq!(config.unresponsive_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HOSTLINK_ENDPOINT", " ws://example.test/ws "),
            ("HOSTLINK_RETRY_INTERVAL_MS", "1500"),
            ("HOSTLINK_PING_INTERVAL_MS", "not-a-number"),
        ]);
        let mut config = ClientConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.endpoint, "ws://example.test/ws");
        assert_eq!(config.retry_interval_ms, 1500);
        assert_eq!(config.ping_interval_ms, DEFAULT_PING_INTERVAL_MS);
        assert!(config.api_key.is_none());
    }
}
