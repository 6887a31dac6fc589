//! Configuration types for the relay

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether one extension may be paired with several devices at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PairingPolicy {
    /// An extension is paired with at most one device; pairing it with a
    /// second device is rejected with a conflict
    #[default]
    Exclusive,
    /// An extension may be paired with any number of devices; token requests
    /// are fanned out to all of them
    MultiDevice,
}

impl std::str::FromStr for PairingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exclusive" | "single" => Ok(PairingPolicy::Exclusive),
            "multi-device" | "multi" => Ok(PairingPolicy::MultiDevice),
            _ => Err(format!(
                "Invalid pairing policy: {}. Use: exclusive, multi-device",
                s
            )),
        }
    }
}

/// Main configuration for the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Origin that WebSocket upgrades must present (any origin when None)
    pub allowed_origin: Option<String>,
    /// Absolute lifetime of a connection, independent of activity
    pub connection_lifetime: Duration,
    /// How long an empty channel is kept around to absorb reconnects
    pub channel_grace: Duration,
    /// Outbound queue capacity per connection
    pub outbound_queue: usize,
    /// How long a token request stays answerable
    pub token_request_validity: Duration,
    /// How long terminal token requests are kept before being reaped
    pub token_request_retention: Duration,
    /// Interval of the expiry/reaping sweep
    pub sweep_interval: Duration,
    /// Pairing exclusivity
    pub pairing_policy: PairingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            allowed_origin: None,
            connection_lifetime: Duration::from_secs(3 * 60),
            channel_grace: Duration::from_millis(2000),
            outbound_queue: 64,
            token_request_validity: Duration::from_secs(120),
            token_request_retention: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(30),
            pairing_policy: PairingPolicy::Exclusive,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: restrict WebSocket upgrades to one origin
    pub fn with_allowed_origin(mut self, origin: Option<String>) -> Self {
        self.allowed_origin = origin.filter(|o| !o.is_empty());
        self
    }

    /// Builder pattern: set absolute connection lifetime
    pub fn with_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_lifetime = lifetime;
        self
    }

    /// Builder pattern: set channel grace window
    pub fn with_channel_grace(mut self, grace: Duration) -> Self {
        self.channel_grace = grace;
        self
    }

    /// Builder pattern: set outbound queue capacity (at least 1)
    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    /// Builder pattern: set token request validity window
    pub fn with_token_request_validity(mut self, validity: Duration) -> Self {
        self.token_request_validity = validity;
        self
    }

    /// Builder pattern: set retention of terminal token requests
    pub fn with_token_request_retention(mut self, retention: Duration) -> Self {
        self.token_request_retention = retention;
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builder pattern: set pairing policy
    pub fn with_pairing_policy(mut self, policy: PairingPolicy) -> Self {
        self.pairing_policy = policy;
        self
    }

    /// Whether an upgrade request carrying `origin` may connect
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match &self.allowed_origin {
            Some(allowed) => origin == Some(allowed.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection_lifetime, Duration::from_secs(180));
        assert_eq!(config.token_request_validity, Duration::from_secs(120));
        assert_eq!(config.pairing_policy, PairingPolicy::Exclusive);
        assert!(config.allowed_origin.is_none());
    }

    #[test]
    fn test_pairing_policy_parsing() {
        assert_eq!(
            "exclusive".parse::<PairingPolicy>().unwrap(),
            PairingPolicy::Exclusive
        );
        assert_eq!(
            "Multi-Device".parse::<PairingPolicy>().unwrap(),
            PairingPolicy::MultiDevice
        );
        assert!("sometimes".parse::<PairingPolicy>().is_err());
    }

    #[test]
    fn test_origin_check() {
        let open = Config::new();
        assert!(open.origin_allowed(None));
        assert!(open.origin_allowed(Some("https://anything.example")));

        let locked = Config::new().with_allowed_origin(Some("chrome-extension://abc".into()));
        assert!(locked.origin_allowed(Some("chrome-extension://abc")));
        assert!(!locked.origin_allowed(Some("https://evil.example")));
        assert!(!locked.origin_allowed(None));
    }

    #[test]
    fn test_empty_origin_means_unrestricted() {
        let config = Config::new().with_allowed_origin(Some(String::new()));
        assert!(config.allowed_origin.is_none());
    }

    #[test]
    fn test_outbound_queue_never_zero() {
        assert_eq!(Config::new().with_outbound_queue(0).outbound_queue, 1);
    }
}
