//! Hub configuration.
//!
//! Chain settings (`PRIVATE_KEY`, `CHAIN_ID`) arrive as flags or environment
//! variables; tuning knobs come from an optional TOML file.

use crate::registry::DuplicatePolicy;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:3131";

/// Everything [`crate::initialize`] needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub chain: ChainConfig,
    pub hub: HubConfig,
}

/// World-state source settings.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    chain_id: u64,
    private_key: PrivateKey,
}

impl ChainConfig {
    /// Validate raw chain settings.
    pub fn new(chain_id: &str, private_key: &str) -> Result<Self, ConfigError> {
        let chain_id = chain_id
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ConfigError::InvalidChainId(chain_id.to_string()))?;
        let private_key = private_key.parse()?;
        Ok(Self {
            chain_id,
            private_key,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

/// A 32-byte signing key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; 32]);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl FromStr for PrivateKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = digits.strip_prefix("0x").unwrap_or(digits);
        if digits.len() != 64 {
            return Err(ConfigError::InvalidPrivateKey);
        }

        let mut key = [0u8; 32];
        hex::decode_to_slice(digits, &mut key).map_err(|_| ConfigError::InvalidPrivateKey)?;

        if key == [0u8; 32] {
            return Err(ConfigError::InvalidPrivateKey);
        }
        Ok(Self(key))
    }
}

/// Hub tuning, loadable from TOML. Missing keys fall back to defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    /// Number of recent events replayed to new connections.
    pub history_len: usize,
    /// What to do when a rat id connects twice.
    pub duplicate_policy: DuplicatePolicy,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_len: 32,
            duplicate_policy: DuplicatePolicy::Replace,
            ping_interval_ms: 15_000,
            pong_timeout_ms: 30_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl HubConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the transport cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ping_interval_ms and handshake_timeout_ms must be positive",
            ));
        }
        if self.pong_timeout_ms < self.ping_interval_ms {
            return Err(ConfigError::Invalid(
                "pong_timeout_ms must be at least ping_interval_ms",
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CHAIN_ID must be a positive integer, got {0:?}")]
    InvalidChainId(String),
    #[error("PRIVATE_KEY must be 32 bytes of hex")]
    InvalidPrivateKey,
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    #[test]
    fn chain_config_parses() {
        let chain = ChainConfig::new("84532", KEY).unwrap();
        assert_eq!(chain.chain_id(), 84532);
        assert_eq!(chain.private_key(), &KEY.parse::<PrivateKey>().unwrap());

        let unprefixed = ChainConfig::new("1", &KEY[2..]).unwrap();
        assert_eq!(unprefixed.private_key(), chain.private_key());

        let upper = ChainConfig::new("1", &KEY[2..].to_uppercase()).unwrap();
        assert_eq!(upper.private_key(), chain.private_key());
    }

    #[test]
    fn bad_chain_id() {
        for id in ["", "abc", "0", "-1"] {
            assert!(matches!(
                ChainConfig::new(id, KEY),
                Err(ConfigError::InvalidChainId(_))
            ));
        }
    }

    #[test]
    fn bad_private_key() {
        let not_hex = format!("{}zz", &KEY[..64]);
        let zero = "0".repeat(64);
        for key in ["", "0x1234", &KEY[..65], not_hex.as_str(), zero.as_str()] {
            assert!(matches!(
                ChainConfig::new("1", key),
                Err(ConfigError::InvalidPrivateKey)
            ));
        }
    }

    #[test]
    fn key_is_redacted() {
        let chain = ChainConfig::new("1", KEY).unwrap();
        let printed = format!("{chain:?}");
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("59c6"));
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            history_len = 5
            duplicate_policy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.history_len, 5);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        config.validate().unwrap();
    }

    #[test]
    fn pong_timeout_must_cover_ping_interval() {
        let config = HubConfig {
            ping_interval_ms: 1_000,
            pong_timeout_ms: 500,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
