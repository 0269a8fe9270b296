//! Relay transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Configuration shared by the relay communicator and receiver.
///
/// `from_env` reads:
///
/// | Variable | Description | Default |
/// |----------|-------------|---------|
/// | `PAYJOIN_RELAYS` | Comma-separated relay URLs | none |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relays to connect to. Senders add the relays named in the endpoint.
    #[serde(default)]
    pub relays: Vec<Url>,

    /// How far back the receiver asks for events on every (re)subscription.
    #[serde(default = "default_since_window")]
    pub since_window_secs: u64,

    /// Interval between expired-key sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// First delay before reconnecting after a failure.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Cap on the doubling reconnect delay.
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,

    /// How long a sender waits for the receiver's reply.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

fn default_since_window() -> u64 {
    30 * 60
}

fn default_sweep_interval() -> u64 {
    100
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_response_timeout() -> u64 {
    60
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            since_window_secs: default_since_window(),
            sweep_interval_ms: default_sweep_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl RelayConfig {
    /// Defaults, with relays from `PAYJOIN_RELAYS`. Unparseable entries are skipped.
    pub fn from_env() -> Self {
        let relays = std::env::var("PAYJOIN_RELAYS")
            .map(|value| parse_relays(&value))
            .unwrap_or_default();
        Self::default().with_relays(relays)
    }

    pub fn with_relays(mut self, relays: Vec<Url>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_relay(mut self, relay: Url) -> Self {
        if !self.relays.contains(&relay) {
            self.relays.push(relay);
        }
        self
    }

    pub fn with_sweep_interval(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_reconnect_delay(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.reconnect_delay_ms = initial_ms;
        self.max_reconnect_delay_ms = max_ms;
        self
    }

    pub fn with_response_timeout(mut self, secs: u64) -> Self {
        self.response_timeout_secs = secs;
        self
    }

    pub fn since_window(&self) -> Duration {
        Duration::from_secs(self.since_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Parse a comma-separated relay list.
pub fn parse_relays(value: &str) -> Vec<Url> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| Url::parse(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.since_window(), Duration::from_secs(1800));
        assert_eq!(config.sweep_interval(), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay(), Duration::from_secs(30));
        assert_eq!(config.response_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_serde_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"relays":["wss://relay.example.com"]}"#).unwrap();
        assert_eq!(config.relays.len(), 1);
        assert_eq!(config.sweep_interval_ms, 100);
    }

    #[test]
    fn test_parse_relays() {
        let relays = parse_relays("wss://a.example, ,not a url,wss://b.example");
        assert_eq!(relays.len(), 2);

        let config = RelayConfig::default()
            .with_relay(relays[0].clone())
            .with_relay(relays[0].clone());
        assert_eq!(config.relays.len(), 1);
    }
}
