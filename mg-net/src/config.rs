//! Configuration for the drivers
//!
//! TOML-backed settings shared by server and client:
//!
//! ```toml
//! max_connections = 64
//! idle_timeout_ms = 15000
//! bind_ipv6 = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::connection::DEFAULT_IDLE_TIMEOUT_MS;
use crate::{Error, Result};

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peers a server admits simultaneously
    pub max_connections: usize,

    /// Inactivity window after which a connection is dropped
    pub idle_timeout_ms: u64,

    /// Whether the server also binds an IPv6 listener
    pub bind_ipv6: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 64,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            bind_ipv6: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::Config("idle_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.idle_timeout_ms, 15_000);
        assert!(config.bind_ipv6);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            max_connections = 8
            idle_timeout_ms = 5000
            bind_ipv6 = false
            "#,
        )
        .unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.idle_timeout_ms, 5000);
        assert!(!config.bind_ipv6);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml("max_connections = 2").unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.idle_timeout_ms, 15_000);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        assert!(Config::from_toml("max_connections = 0").is_err());
        assert!(Config::from_toml("idle_timeout_ms = 0").is_err());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Config::from_toml("max_connections = \"many\""),
            Err(Error::ConfigParse(_))
        ));
    }
}
