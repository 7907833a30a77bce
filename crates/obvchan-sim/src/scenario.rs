//! The phases of one simulation run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use obvchan_protocol::ApplicationMessage;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SimConfig;
use crate::device::{run_device, SimDevice, SimStats, TaskOptions};
use crate::relay::Relay;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimReport {
    pub devices: usize,
    pub confirmed_pairs: usize,
    pub one_to_one_pairs: usize,
    pub application_messages: u64,
    pub frames: u64,
    pub undelivered: u64,
    pub failures: u64,
}

struct Simulation {
    config: SimConfig,
    relay: Arc<Relay>,
    stats: Arc<SimStats>,
    devices: Vec<Arc<SimDevice>>,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn run(config: SimConfig) -> Result<SimReport> {
    if config.devices < 2 {
        bail!("a simulation needs at least two devices, got {}", config.devices);
    }
    let mut sim = Simulation::start(config)?;
    let result = sim.run_phases().await;
    sim.shutdown().await;
    result
}

impl Simulation {
    fn start(config: SimConfig) -> Result<Self> {
        let relay = Arc::new(Relay::new());
        let stats = Arc::new(SimStats::default());

        let mut devices = Vec::with_capacity(config.devices);
        for index in 0..config.devices {
            let device = SimDevice::new(format!("device-{}", index), relay.clone(), config.engine.clone())?;
            devices.push(Arc::new(device));
        }
        for (i, a) in devices.iter().enumerate() {
            for b in &devices[i + 1..] {
                a.directory.add_contact(a.identity, b.identity, vec![b.uid]);
                b.directory.add_contact(b.identity, a.identity, vec![a.uid]);
            }
        }

        let mut tasks = Vec::with_capacity(devices.len());
        for (index, device) in devices.iter().enumerate() {
            let (frames, dialogs) = relay.connect(device.uid, device.identity);
            let options = TaskOptions {
                max_jitter_ms: config.max_jitter_ms,
                seed: config.seed.wrapping_add(index as u64),
                accept_invitations: config.accept_invitations,
            };
            tasks.push(tokio::spawn(run_device(
                device.clone(),
                relay.clone(),
                stats.clone(),
                frames,
                dialogs,
                options,
            )));
        }
        info!(devices = devices.len(), "devices online");

        Ok(Self {
            config,
            relay,
            stats,
            devices,
            tasks,
        })
    }

    fn pairs(&self) -> Vec<(usize, usize)> {
        let n = self.devices.len();
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect()
    }

    async fn run_phases(&self) -> Result<SimReport> {
        let confirmed_pairs = self.create_channels().await?;
        let one_to_one_pairs = if self.config.one_to_one {
            self.invite_one_to_one().await?
        } else {
            0
        };
        self.exchange_messages().await?;

        let report = SimReport {
            devices: self.devices.len(),
            confirmed_pairs,
            one_to_one_pairs,
            application_messages: SimStats::get(&self.stats.application_messages),
            frames: SimStats::get(&self.stats.frames),
            undelivered: SimStats::get(&self.stats.undelivered),
            failures: SimStats::get(&self.stats.failures),
        };
        if report.failures > 0 {
            warn!(failures = report.failures, "simulation finished with failures");
        }
        Ok(report)
    }

    async fn create_channels(&self) -> Result<usize> {
        for (i, j) in self.pairs() {
            let (a, b) = (&self.devices[i], &self.devices[j]);
            a.manager.start_channel_creation(a.identity, b.identity, b.uid)?;
            if self.config.concurrent_starts {
                b.manager.start_channel_creation(b.identity, a.identity, a.uid)?;
            }
        }
        self.settle("channel creation", || {
            for (i, j) in self.pairs() {
                let (a, b) = (&self.devices[i], &self.devices[j]);
                if !a.has_confirmed_channel_with(b)? || !b.has_confirmed_channel_with(a)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await?;
        let pairs = self.pairs().len();
        info!(pairs, relayed = self.relay.posted_count(), "every pair holds a confirmed channel");
        Ok(pairs)
    }

    async fn invite_one_to_one(&self) -> Result<usize> {
        let inviter = &self.devices[0];
        for invitee in &self.devices[1..] {
            inviter
                .manager
                .start_one_to_one_invitation(inviter.identity, invitee.identity)?;
        }
        self.settle("one-to-one invitations", || {
            for device in &self.devices {
                if device.pending_invitations()? > 0 {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await?;

        let mut upgraded = 0;
        for invitee in &self.devices[1..] {
            if inviter.is_one_to_one_with(invitee)? && invitee.is_one_to_one_with(inviter)? {
                upgraded += 1;
            }
        }
        info!(upgraded, "one-to-one invitations settled");
        Ok(upgraded)
    }

    async fn exchange_messages(&self) -> Result<()> {
        let before = SimStats::get(&self.stats.application_messages);
        let mut sent = 0u64;
        for from in &self.devices {
            for to in &self.devices {
                if from.uid == to.uid {
                    continue;
                }
                let message = ApplicationMessage {
                    payload: format!("hello from {} to {}", from.name, to.name).into_bytes(),
                    attachments: vec![],
                };
                sent += from
                    .manager
                    .send_application_message(from.identity, to.identity, message)?
                    as u64;
            }
        }
        self.settle("application messages", || {
            Ok(SimStats::get(&self.stats.application_messages) - before >= sent)
        })
        .await?;
        info!(sent, "application messages delivered");
        Ok(())
    }

    /// Wait until the relay is idle and `done` holds.
    async fn settle(&self, phase: &str, done: impl Fn() -> Result<bool>) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.phase_timeout_secs);
        loop {
            if self.relay.is_idle() && done()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} did not settle within {}s",
                    phase,
                    self.config.phase_timeout_secs
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn shutdown(&mut self) {
        self.relay.disconnect_all();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("device task ended abnormally: {}", e);
            }
        }
    }
}
