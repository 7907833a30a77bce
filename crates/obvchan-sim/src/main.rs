use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod config;
mod device;
mod relay;
mod scenario;

use config::SimConfig;

#[derive(Parser)]
#[command(
    name = "obvchan-sim",
    about = "Drive oblivious channel handshakes between in-memory devices"
)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Number of devices, overrides config
    #[arg(short, long)]
    devices: Option<usize>,

    /// Jitter seed, overrides config
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum per-frame delay in milliseconds, overrides config
    #[arg(long)]
    max_jitter_ms: Option<u64>,

    /// Only the first device of each pair starts the handshake
    #[arg(long)]
    sequential: bool,

    /// Decline one-to-one invitations instead of accepting them
    #[arg(long)]
    decline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obvchan_sim=info,obvchan_engine=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimConfig::load_from_file(Path::new(path))?,
        None => SimConfig::default(),
    };

    if let Some(devices) = args.devices {
        config.devices = devices;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(jitter) = args.max_jitter_ms {
        config.max_jitter_ms = jitter;
    }
    if args.sequential {
        config.concurrent_starts = false;
    }
    if args.decline {
        config.accept_invitations = false;
    }

    info!(
        devices = config.devices,
        seed = config.seed,
        concurrent = config.concurrent_starts,
        "simulation starting"
    );

    let report = scenario::run(config).await.context("simulation failed")?;

    info!(
        devices = report.devices,
        confirmed_pairs = report.confirmed_pairs,
        one_to_one_pairs = report.one_to_one_pairs,
        messages = report.application_messages,
        frames = report.frames,
        undelivered = report.undelivered,
        failures = report.failures,
        "simulation finished"
    );
    Ok(())
}
