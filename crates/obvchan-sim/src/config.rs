use std::path::Path;

use anyhow::{Context, Result};
use obvchan_engine::EngineConfig;
use serde::Deserialize;

/// Simulation run, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Number of devices, one owned identity each. Every pair is introduced.
    #[serde(default = "default_devices")]
    pub devices: usize,

    /// Seed for the per-device delivery jitter.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Upper bound on the random delay before a device handles a frame.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Both ends of every pair start the handshake at the same time.
    #[serde(default = "default_true")]
    pub concurrent_starts: bool,

    /// After the channels exist, the first device invites everyone else to
    /// a one-to-one discussion.
    #[serde(default = "default_true")]
    pub one_to_one: bool,

    /// Answer received invitations with "accept".
    #[serde(default = "default_true")]
    pub accept_invitations: bool,

    /// Give up on a phase after this long.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_devices() -> usize {
    4
}

fn default_seed() -> u64 {
    7
}

fn default_max_jitter_ms() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_phase_timeout_secs() -> u64 {
    30
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            seed: default_seed(),
            max_jitter_ms: default_max_jitter_ms(),
            concurrent_starts: true,
            one_to_one: true,
            accept_invitations: true,
            phase_timeout_secs: default_phase_timeout_secs(),
            engine: EngineConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }
}
