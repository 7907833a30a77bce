//! The protocol manager: one per device process.
//!
//! Every public operation runs as a flow: begin a context on the store, do
//! the work, commit. A commit that loses the race against a concurrent flow
//! is retried from scratch. Side effects collected on the context are
//! released only after the commit: identity updates go to the identity
//! delegate, envelopes and dialogs to the transport, and local messages are
//! fed back into the engine as new flows.

use std::collections::VecDeque;
use std::sync::Arc;

use obvchan_crypto::{PreKey, PublishedPreKey};
use obvchan_protocol::{
    ApplicationMessage, ChannelMessage, CryptoIdentity, Envelope, InstanceId, ProtocolKind,
    ProtocolMessage, Uid,
};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::context::{FlowEffects, ObvContext, ReceptionChannelInfo, SendChannel};
use crate::decryptor::{DecryptionOutcome, Decryptor};
use crate::delegates::{IdentityDelegate, IdentityUpdate, Transport};
use crate::error::{EngineError, StoreError};
use crate::outbox;
use crate::protocol::channel_creation::{self, ChannelCreationProtocol};
use crate::protocol::one_to_one::{self, OneToOneInvitationProtocol};
use crate::protocol::{abort_instance, process_protocol_message, protocol_message, DispatchOutcome};
use crate::store::{ChannelKey, InstanceKey, Store};

/// A protocol instance started by a local request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub instance_id: InstanceId,
    pub outcome: DispatchOutcome,
}

/// Work fed back into the engine after a commit.
#[derive(Debug)]
enum LocalWork {
    Message {
        owner: CryptoIdentity,
        message: ProtocolMessage,
    },
    ContactUpgraded {
        owner: CryptoIdentity,
        contact: CryptoIdentity,
    },
}

pub struct ProtocolManager {
    pub(crate) store: Arc<Store>,
    pub(crate) identity: Arc<dyn IdentityDelegate>,
    transport: Arc<dyn Transport>,
    pub(crate) decryptor: Decryptor,
    config: EngineConfig,
}

#[derive(Default)]
pub struct ProtocolManagerBuilder {
    store: Option<Arc<Store>>,
    identity: Option<Arc<dyn IdentityDelegate>>,
    transport: Option<Arc<dyn Transport>>,
    decryptor: Option<Decryptor>,
    config: Option<EngineConfig>,
}

impl ProtocolManagerBuilder {
    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityDelegate>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn decryptor(mut self, decryptor: Decryptor) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Fails when a delegate is missing; the store, decryptor and config
    /// fall back to defaults.
    pub fn build(self) -> Result<ProtocolManager, EngineError> {
        let Some(identity) = self.identity else {
            error!("protocol manager needs an identity delegate");
            return Err(EngineError::MissingDelegate("identity"));
        };
        let Some(transport) = self.transport else {
            error!("protocol manager needs a transport delegate");
            return Err(EngineError::MissingDelegate("transport"));
        };
        Ok(ProtocolManager {
            store: self.store.unwrap_or_default(),
            identity,
            transport,
            decryptor: self.decryptor.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        })
    }
}

impl ProtocolManager {
    pub fn builder() -> ProtocolManagerBuilder {
        ProtocolManagerBuilder::default()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `f` as a flow, release its effects and drain the local messages
    /// it produced.
    pub fn perform<R>(
        &self,
        f: impl Fn(&mut ObvContext) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let (result, effects) = self.run_flow(f)?;
        let pending = self.flush(effects);
        self.drain_local(pending);
        Ok(result)
    }

    fn run_flow<R>(
        &self,
        f: impl Fn(&mut ObvContext) -> Result<R, EngineError>,
    ) -> Result<(R, FlowEffects), EngineError> {
        let mut attempts = 0;
        loop {
            let mut ctx = self.store.begin()?;
            let flow_id = ctx.flow_id();
            let result = match f(&mut ctx) {
                Ok(result) => result,
                Err(e) => {
                    warn!(flow = %flow_id, "flow aborted: {}", e);
                    return Err(e);
                }
            };
            match self.store.commit(ctx) {
                Ok(effects) => return Ok((result, effects)),
                Err(StoreError::CommitConflict { .. }) => {
                    attempts += 1;
                    if attempts > self.config.max_commit_retries {
                        warn!(flow = %flow_id, attempts, "giving up on conflicting flow");
                        return Err(EngineError::RetriesExhausted { attempts });
                    }
                    debug!(flow = %flow_id, attempts, "retrying flow after commit conflict");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release the effects of a committed flow. Failures here cannot undo
    /// the commit and are logged.
    fn flush(&self, effects: FlowEffects) -> VecDeque<LocalWork> {
        let mut pending = VecDeque::new();
        let flow_id = effects.flow_id;

        for update in effects.identity_updates {
            let upgraded = match &update {
                IdentityUpdate::SetOneToOne {
                    owner,
                    contact,
                    one_to_one: true,
                } => Some((*owner, *contact)),
                _ => None,
            };
            if let Err(e) = self.identity.apply(update) {
                error!(flow = %flow_id, "identity update failed: {}", e);
                continue;
            }
            if let Some((owner, contact)) = upgraded {
                pending.push_back(LocalWork::ContactUpgraded { owner, contact });
            }
        }

        for envelope in effects.envelopes {
            let to = envelope.to_device;
            if let Err(e) = self.transport.post_envelope(flow_id, envelope) {
                error!(flow = %flow_id, device = %to, "could not post envelope: {}", e);
            }
        }

        for (owner, dialog) in effects.dialogs {
            if let Err(e) = self.transport.post_dialog(&owner, dialog) {
                error!(flow = %flow_id, %owner, "could not post dialog: {}", e);
            }
        }

        pending.extend(
            effects
                .local_messages
                .into_iter()
                .map(|(owner, message)| LocalWork::Message { owner, message }),
        );
        pending
    }

    /// Run local work until none is left or the cascade limit is hit.
    fn drain_local(&self, mut pending: VecDeque<LocalWork>) {
        let mut processed = 0;
        while let Some(work) = pending.pop_front() {
            if processed >= self.config.max_local_cascade {
                warn!(dropped = pending.len() + 1, "local message cascade limit reached");
                return;
            }
            processed += 1;

            let flow = match &work {
                LocalWork::Message { owner, message } => self.run_flow(|ctx| {
                    self.process_received_message(ctx, *owner, message, ReceptionChannelInfo::Local)
                        .map(|_| ())
                }),
                LocalWork::ContactUpgraded { owner, contact } => {
                    self.run_flow(|ctx| self.queue_contact_upgraded(ctx, owner, contact))
                }
            };
            match flow {
                Ok(((), effects)) => pending.extend(self.flush(effects)),
                Err(e) => error!(?work, "local flow failed: {}", e),
            }
        }
    }

    /// Run a protocol message through the step engine inside `ctx`.
    pub fn process_received_message(
        &self,
        ctx: &mut ObvContext,
        owner: CryptoIdentity,
        message: &ProtocolMessage,
        reception: ReceptionChannelInfo,
    ) -> Result<DispatchOutcome, EngineError> {
        Ok(process_protocol_message(
            ctx,
            &*self.identity,
            &self.config,
            owner,
            message,
            reception,
        )?)
    }

    fn start(
        &self,
        owner: CryptoIdentity,
        make: impl Fn(InstanceId) -> Result<ProtocolMessage, EngineError>,
    ) -> Result<Started, EngineError> {
        self.perform(|ctx| {
            let instance_id = InstanceId::random();
            let message = make(instance_id)?;
            let outcome =
                self.process_received_message(ctx, owner, &message, ReceptionChannelInfo::Local)?;
            Ok(Started {
                instance_id,
                outcome,
            })
        })
    }

    /// Start a channel creation handshake with one device of `contact`.
    pub fn start_channel_creation(
        &self,
        owner: CryptoIdentity,
        contact: CryptoIdentity,
        contact_device: Uid,
    ) -> Result<Started, EngineError> {
        info!(%contact, device = %contact_device, "starting channel creation");
        self.start(owner, |instance_id| {
            Ok(protocol_message::<ChannelCreationProtocol>(
                instance_id,
                &channel_creation::Message::Initial {
                    contact,
                    contact_device,
                },
            )?)
        })
    }

    /// Start a channel creation with every known device of `contact` that
    /// has no channel yet.
    pub fn start_channel_creation_with_all_devices(
        &self,
        owner: CryptoIdentity,
        contact: CryptoIdentity,
    ) -> Result<Vec<Started>, EngineError> {
        let own_device = self.identity.current_device_uid(&owner)?;
        let devices = self.identity.contact_device_uids(&owner, &contact)?;
        let mut started = Vec::new();
        for device in devices {
            let exists = self.store.read(|db| {
                db.channels.exists(&ChannelKey {
                    owner_device: own_device,
                    remote_identity: contact,
                    remote_device: device,
                })
            })?;
            if !exists {
                started.push(self.start_channel_creation(owner, contact, device)?);
            }
        }
        Ok(started)
    }

    pub fn start_one_to_one_invitation(
        &self,
        owner: CryptoIdentity,
        contact: CryptoIdentity,
    ) -> Result<Started, EngineError> {
        info!(%contact, "inviting contact to one-to-one");
        self.start(owner, |instance_id| {
            Ok(protocol_message::<OneToOneInvitationProtocol>(
                instance_id,
                &one_to_one::Message::Initial { contact },
            )?)
        })
    }

    /// The user's answer to an `AcceptOneToOneInvitation` dialog.
    pub fn respond_to_one_to_one_invitation(
        &self,
        owner: CryptoIdentity,
        instance_id: InstanceId,
        accept: bool,
    ) -> Result<DispatchOutcome, EngineError> {
        let message = protocol_message::<OneToOneInvitationProtocol>(
            instance_id,
            &one_to_one::Message::DialogResponse { accept },
        )?;
        self.perform(|ctx| {
            self.process_received_message(ctx, owner, &message, ReceptionChannelInfo::Local)
        })
    }

    pub fn abort_protocol(
        &self,
        protocol: ProtocolKind,
        instance_id: InstanceId,
        owner: CryptoIdentity,
    ) -> Result<DispatchOutcome, EngineError> {
        let key = InstanceKey {
            protocol,
            instance_id,
            owner,
        };
        self.perform(|ctx| Ok(abort_instance(ctx, &*self.identity, &self.config, &key)?))
    }

    /// Decrypt and process one envelope from the relay server.
    pub fn receive_envelope(&self, envelope: &Envelope) -> Result<DecryptionOutcome, EngineError> {
        self.perform(|ctx| self.decrypt_and_dispatch(ctx, envelope))
    }

    /// `contact` became one-to-one for `owner` outside of any invitation.
    pub fn contact_upgraded_to_one_to_one(
        &self,
        owner: CryptoIdentity,
        contact: CryptoIdentity,
    ) -> Result<usize, EngineError> {
        self.perform(|ctx| {
            let before = ctx.effects().local_messages.len();
            self.queue_contact_upgraded(ctx, &owner, &contact)?;
            Ok(ctx.effects().local_messages.len() - before)
        })
    }

    fn queue_contact_upgraded(
        &self,
        ctx: &mut ObvContext,
        owner: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<(), EngineError> {
        if ctx.db().waiting.all_for(owner, contact).is_empty() {
            return Ok(());
        }
        for entry in ctx.db_mut().waiting.take_all_for(owner, contact) {
            debug!(%contact, instance = %entry.instance.instance_id, "replaying waiting instance");
            ctx.push_local(entry.owner, entry.replay_message());
        }
        Ok(())
    }

    /// Replay every waiting-for-condition entry once, after a restart.
    /// Entries stay in place; the replayed steps decide what to do.
    pub fn replay_waiting_for_condition_at_startup(&self) -> Result<usize, EngineError> {
        let replayed = self.perform(|ctx| {
            let messages: Vec<_> = ctx
                .db()
                .waiting
                .iter()
                .map(|entry| (entry.owner, entry.replay_message()))
                .collect();
            let count = messages.len();
            for (owner, message) in messages {
                ctx.push_local(owner, message);
            }
            Ok(count)
        })?;
        info!(replayed, "replayed waiting-for-condition entries");
        Ok(replayed)
    }

    /// Generate and store a pre-key for the current device of `owner`.
    pub fn generate_prekey(&self, owner: CryptoIdentity) -> Result<PublishedPreKey, EngineError> {
        let device = self.identity.current_device_uid(&owner)?;
        let lifetime = self.config.prekey_lifetime_millis();
        self.perform(|ctx| {
            let prekey = PreKey::generate(ctx.now_millis(), lifetime)?;
            let published = prekey.published();
            ctx.db_mut().prekeys.insert(owner, device, prekey);
            Ok(published)
        })
    }

    /// The valid pre-key of `owner`'s current device, generating one if none is.
    pub fn current_prekey(&self, owner: CryptoIdentity) -> Result<PublishedPreKey, EngineError> {
        let device = self.identity.current_device_uid(&owner)?;
        let now = crate::unix_millis();
        let current = self
            .store
            .read(|db| db.prekeys.current_for(&device, now).map(|entry| entry.prekey.published()))?;
        match current {
            Some(published) => Ok(published),
            None => self.generate_prekey(owner),
        }
    }

    /// Drop replay guard entries past retention and expired pre-keys.
    pub fn prune_expired(&self, now_millis: u64) -> Result<(usize, usize), EngineError> {
        let cutoff = now_millis.saturating_sub(self.config.replay_guard_retention_millis());
        let pruned = self.perform(|ctx| {
            let db = ctx.db_mut();
            Ok((db.replay_guard.prune(cutoff), db.prekeys.remove_expired(now_millis)))
        })?;
        debug!(signatures = pruned.0, prekeys = pruned.1, "pruned expired state");
        Ok(pruned)
    }

    /// Send an application message to every confirmed channel with `to`.
    pub fn send_application_message(
        &self,
        owner: CryptoIdentity,
        to: CryptoIdentity,
        message: ApplicationMessage,
    ) -> Result<usize, EngineError> {
        let owner_device = self.identity.current_device_uid(&owner)?;
        let device_uids = self.identity.contact_device_uids(&owner, &to)?;
        self.perform(|ctx| {
            let before = ctx.effects().envelopes.len();
            outbox::post(
                ctx,
                &*self.identity,
                ChannelMessage::Application(message.clone()),
                SendChannel::Oblivious {
                    owner,
                    owner_device,
                    to,
                    device_uids: device_uids.clone(),
                    must_be_confirmed: true,
                },
            )?;
            Ok(ctx.effects().envelopes.len() - before)
        })
    }

    /// Send an application message to one device through its published pre-key.
    pub fn send_application_message_with_prekey(
        &self,
        owner: CryptoIdentity,
        to: CryptoIdentity,
        device_uid: Uid,
        prekey: PublishedPreKey,
        message: ApplicationMessage,
    ) -> Result<(), EngineError> {
        let owner_device = self.identity.current_device_uid(&owner)?;
        self.perform(|ctx| {
            Ok(outbox::post(
                ctx,
                &*self.identity,
                ChannelMessage::Application(message.clone()),
                SendChannel::PreKey {
                    owner,
                    owner_device,
                    to,
                    device_uid,
                    prekey,
                },
            )?)
        })
    }

    /// Encrypted snapshot of the whole store.
    pub fn export_snapshot(&self, password: &str) -> Result<Vec<u8>, EngineError> {
        Ok(self.store.export_snapshot(password)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityDirectory, MemoryNetwork};

    #[test]
    fn builder_requires_delegates() {
        let result = ProtocolManager::builder()
            .transport(Arc::new(MemoryNetwork::new()))
            .build();
        assert!(matches!(result, Err(EngineError::MissingDelegate("identity"))));

        let result = ProtocolManager::builder()
            .identity(Arc::new(MemoryIdentityDirectory::new()))
            .build();
        assert!(matches!(result, Err(EngineError::MissingDelegate("transport"))));
    }

    #[test]
    fn conflicting_flows_are_retried() {
        let manager = ProtocolManager::builder()
            .identity(Arc::new(MemoryIdentityDirectory::new()))
            .transport(Arc::new(MemoryNetwork::new()))
            .build()
            .unwrap();
        let store = manager.store().clone();
        let attempts = std::sync::atomic::AtomicU32::new(0);

        // The first attempt races a concurrent writer and loses.
        let result = manager.perform(|ctx| {
            if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                let mut other = store.begin()?;
                other.db_mut().replay_guard.check_and_insert(
                    &CryptoIdentity {
                        signing_key: [1u8; 32],
                        encryption_key: [1u8; 32],
                    },
                    b"signature",
                    0,
                );
                store.commit(other)?;
            }
            ctx.db_mut();
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(store.version().unwrap(), 2);
    }

    #[test]
    fn retries_are_bounded() {
        let config = EngineConfig {
            max_commit_retries: 2,
            ..EngineConfig::default()
        };
        let manager = ProtocolManager::builder()
            .identity(Arc::new(MemoryIdentityDirectory::new()))
            .transport(Arc::new(MemoryNetwork::new()))
            .config(config)
            .build()
            .unwrap();
        let store = manager.store().clone();

        let result = manager.perform(|ctx| {
            let mut other = store.begin()?;
            other.db_mut();
            store.commit(other)?;
            ctx.db_mut();
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::RetriesExhausted { attempts: 3 })));
    }
}
