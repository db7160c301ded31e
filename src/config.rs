//! Relay configuration
//!
//! A small JSON options map. Unknown keys are rejected so a typo never
//! silently turns into a default.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Smallest link MTU the relay accepts
pub const MIN_RELAY_MTU: u16 = 576;

fn default_timeout_seconds() -> u32 {
    60
}

fn default_mtu() -> u16 {
    1492
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Idle connection eviction timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,

    /// Link MTU the packet budget is derived from
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Enable `SO_REUSEPORT` on the listening socket
    #[serde(default)]
    pub reuse_port: bool,

    /// Source address for IPv4 upstream sockets
    #[serde(default)]
    pub bind_local_addr4: Option<Ipv4Addr>,

    /// Source address for IPv6 upstream sockets
    #[serde(default)]
    pub bind_local_addr6: Option<Ipv6Addr>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            mtu: default_mtu(),
            reuse_port: false,
            bind_local_addr4: None,
            bind_local_addr6: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("mtu {0} below the minimum of {MIN_RELAY_MTU}")]
    MtuTooSmall(u16),
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_RELAY_MTU {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config.timeout_seconds, 60);
        assert_eq!(config.mtu, 1492);
        assert!(!config.reuse_port);
        assert!(config.bind_local_addr4.is_none());
    }

    #[test]
    fn recognised_keys_parse() {
        let config = RelayConfig::from_json(
            r#"{
                "timeout_seconds": 120,
                "mtu": 1400,
                "reuse_port": true,
                "bind_local_addr4": "192.0.2.1",
                "bind_local_addr6": "2001:db8::1"
            }"#,
        )
        .unwrap();
        assert_eq!(config.timeout_seconds, 120);
        assert_eq!(config.mtu, 1400);
        assert!(config.reuse_port);
        assert_eq!(config.bind_local_addr4, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert!(config.bind_local_addr6.is_some());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RelayConfig::from_json(r#"{"timeout_secs": 30}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn small_mtu_is_rejected() {
        let err = RelayConfig::from_json(r#"{"mtu": 500}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MtuTooSmall(500)));
    }
}
