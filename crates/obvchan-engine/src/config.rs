use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Engine tunables, loaded from the `[engine]` table of a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// How many times a flow is re-run after losing a commit race.
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,

    /// Upper bound on local messages processed after one external flow.
    #[serde(default = "default_max_local_cascade")]
    pub max_local_cascade: usize,

    /// How long a received challenge signature is remembered, in seconds.
    #[serde(default = "default_replay_guard_retention_secs")]
    pub replay_guard_retention_secs: u64,

    /// Lifetime of freshly generated pre-keys, in seconds.
    #[serde(default = "default_prekey_lifetime_secs")]
    pub prekey_lifetime_secs: u64,

    /// Suite version recorded on newly created channels.
    #[serde(default = "default_channel_suite_version")]
    pub channel_suite_version: u8,

    /// Start capability discovery and one-to-one status sync once a channel
    /// is confirmed.
    #[serde(default = "default_post_confirmation_protocols")]
    pub post_confirmation_protocols: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_max_commit_retries() -> u32 {
    3
}

fn default_max_local_cascade() -> usize {
    64
}

fn default_replay_guard_retention_secs() -> u64 {
    30 * 24 * 3600
}

fn default_prekey_lifetime_secs() -> u64 {
    7 * 24 * 3600
}

fn default_channel_suite_version() -> u8 {
    1
}

fn default_post_confirmation_protocols() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: default_max_commit_retries(),
            max_local_cascade: default_max_local_cascade(),
            replay_guard_retention_secs: default_replay_guard_retention_secs(),
            prekey_lifetime_secs: default_prekey_lifetime_secs(),
            channel_suite_version: default_channel_suite_version(),
            post_confirmation_protocols: default_post_confirmation_protocols(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn replay_guard_retention_millis(&self) -> u64 {
        self.replay_guard_retention_secs.saturating_mul(1000)
    }

    pub fn prekey_lifetime_millis(&self) -> u64 {
        self.prekey_lifetime_secs.saturating_mul(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_commit_retries, 3);
        assert_eq!(config.max_local_cascade, 64);
        assert_eq!(config.replay_guard_retention_secs, 2_592_000);
        assert_eq!(config.prekey_lifetime_secs, 604_800);
        assert_eq!(config.channel_suite_version, 1);
        assert!(config.post_confirmation_protocols);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_commit_retries = 7
            post_confirmation_protocols = false
        "#,
        )
        .unwrap();
        assert_eq!(config.max_commit_retries, 7);
        assert!(!config.post_confirmation_protocols);
        assert_eq!(config.max_local_cascade, 64);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_commit_retries = \"three\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
