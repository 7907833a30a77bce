use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use obvchan_engine::memory::MemoryIdentityDirectory;
use obvchan_engine::store::ChannelKey;
use obvchan_engine::{DecryptionOutcome, EngineConfig, IdentityDelegate, ProtocolManager};
use obvchan_protocol::codec::{decode_frame_payload, try_decode_frame};
use obvchan_protocol::{CryptoIdentity, DialogCategory, DialogMessage, Envelope, ProtocolKind, Uid};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::relay::Relay;

/// Counters shared by every device task.
#[derive(Debug, Default)]
pub struct SimStats {
    pub frames: AtomicU64,
    pub protocol_messages: AtomicU64,
    pub application_messages: AtomicU64,
    pub undelivered: AtomicU64,
    pub failures: AtomicU64,
}

impl SimStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub struct SimDevice {
    pub name: String,
    pub identity: CryptoIdentity,
    pub uid: Uid,
    pub directory: Arc<MemoryIdentityDirectory>,
    pub manager: ProtocolManager,
}

impl SimDevice {
    pub fn new(name: String, relay: Arc<Relay>, config: EngineConfig) -> Result<Self> {
        let directory = Arc::new(MemoryIdentityDirectory::new());
        let (identity, uid) = directory.create_owned_identity()?;
        let manager = ProtocolManager::builder()
            .identity(directory.clone())
            .transport(relay)
            .config(config)
            .build()?;
        Ok(Self {
            name,
            identity,
            uid,
            directory,
            manager,
        })
    }

    pub fn has_confirmed_channel_with(&self, peer: &SimDevice) -> Result<bool> {
        let key = ChannelKey {
            owner_device: self.uid,
            remote_identity: peer.identity,
            remote_device: peer.uid,
        };
        Ok(self
            .manager
            .store()
            .read(|db| db.channels.get(&key).is_some_and(|channel| channel.confirmed))?)
    }

    pub fn is_one_to_one_with(&self, peer: &SimDevice) -> Result<bool> {
        Ok(self.directory.is_one_to_one(&self.identity, &peer.identity)?)
    }

    pub fn pending_invitations(&self) -> Result<usize> {
        Ok(self.manager.store().read(|db| {
            db.instances
                .keys_for(&self.identity, ProtocolKind::OneToOneInvitation)
                .len()
        })?)
    }

    fn handle_envelope(&self, envelope: &Envelope, stats: &SimStats) {
        match self.manager.receive_envelope(envelope) {
            Ok(DecryptionOutcome::RemoteIdentityResolved(message)) => {
                stats.application_messages.fetch_add(1, Ordering::Relaxed);
                info!(
                    device = %self.name,
                    from = %message.remote_identity,
                    text = %String::from_utf8_lossy(&message.payload),
                    "application message received"
                );
            }
            Ok(DecryptionOutcome::ProtocolMessageProcessed(outcome)) => {
                stats.protocol_messages.fetch_add(1, Ordering::Relaxed);
                debug!(device = %self.name, ?outcome, "protocol message processed");
            }
            Ok(other) => {
                stats.undelivered.fetch_add(1, Ordering::Relaxed);
                warn!(device = %self.name, outcome = ?other, "envelope not delivered");
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(device = %self.name, "failed to process envelope: {}", e);
            }
        }
    }

    fn handle_dialog(&self, dialog: DialogMessage, accept_invitations: bool, stats: &SimStats) {
        match dialog.category {
            DialogCategory::AcceptOneToOneInvitation { contact } => {
                info!(device = %self.name, %contact, accept = accept_invitations, "answering invitation");
                if let Err(e) = self.manager.respond_to_one_to_one_invitation(
                    self.identity,
                    dialog.instance_id,
                    accept_invitations,
                ) {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!(device = %self.name, "failed to answer invitation: {}", e);
                }
            }
            DialogCategory::OneToOneInvitationSent { contact } => {
                debug!(device = %self.name, %contact, "invitation pending");
            }
        }
    }
}

/// Options of a device task.
pub struct TaskOptions {
    pub max_jitter_ms: u64,
    pub seed: u64,
    pub accept_invitations: bool,
}

/// Read frames and dialogs until the relay drops this device.
pub async fn run_device(
    device: Arc<SimDevice>,
    relay: Arc<Relay>,
    stats: Arc<SimStats>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut dialogs: mpsc::UnboundedReceiver<DialogMessage>,
    options: TaskOptions,
) {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            chunk = frames.recv() => {
                let Some(chunk) = chunk else {
                    break;
                };
                buf.extend_from_slice(&chunk);
                loop {
                    match try_decode_frame(&mut buf) {
                        Ok(Some(payload)) => {
                            if options.max_jitter_ms > 0 {
                                let delay = rng.gen_range(0..=options.max_jitter_ms);
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                            stats.frames.fetch_add(1, Ordering::Relaxed);
                            match decode_frame_payload::<Envelope>(&payload) {
                                Ok(envelope) => device.handle_envelope(&envelope, &stats),
                                Err(e) => {
                                    stats.failures.fetch_add(1, Ordering::Relaxed);
                                    warn!(device = %device.name, "failed to decode frame: {}", e);
                                }
                            }
                            relay.handled();
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(device = %device.name, "frame error, dropping buffer: {}", e);
                            buf.clear();
                            break;
                        }
                    }
                }
            }
            dialog = dialogs.recv() => {
                let Some(dialog) = dialog else {
                    break;
                };
                device.handle_dialog(dialog, options.accept_invitations, &stats);
                relay.handled();
            }
        }
    }
    debug!(device = %device.name, "device task stopped");
}
