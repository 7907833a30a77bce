//! Durable engine state.
//!
//! All tables live in one [`Database`] value owned by the [`Store`]. A flow
//! works on a private copy obtained from [`Store::begin`] and publishes it
//! with [`Store::commit`], which fails if another flow committed in between.
//! This gives every flow all-or-nothing semantics over protocol state,
//! channels and pre-keys together.

mod channels;
mod instances;
mod prekeys;
mod replay_guard;
mod waiting;

use std::sync::{Mutex, MutexGuard};

use obvchan_crypto::persistence::{open_blob, seal_blob};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

pub use channels::{ChannelKey, ChannelTable, ChannelUnwrap, ObliviousChannel};
pub use instances::{ChannelCreationIndex, InstanceKey, InstanceTable};
pub use prekeys::{PreKeyEntry, PreKeyTable};
pub use replay_guard::ReplayGuardTable;
pub use waiting::{WaitingForCondition, WaitingTable};

use crate::context::{FlowEffects, ObvContext};
use crate::error::StoreError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    pub instances: InstanceTable,
    pub waiting: WaitingTable,
    pub replay_guard: ReplayGuardTable,
    pub channel_creation: ChannelCreationIndex,
    pub channels: ChannelTable,
    pub prekeys: PreKeyTable,
}

impl Database {
    /// Delete an instance together with everything that points at it.
    pub fn delete_instance(&mut self, key: &InstanceKey) -> bool {
        let removed = self.instances.remove(key).is_some();
        let waiting = self.waiting.delete_for_instance(key);
        self.channel_creation
            .forget_instance(&key.owner, &key.instance_id);
        if removed {
            trace!(protocol = ?key.protocol, instance = %key.instance_id, waiting, "instance deleted");
        }
        removed
    }
}

#[derive(Default)]
struct Versioned {
    version: u64,
    db: Database,
}

/// Versioned home of one device's [`Database`].
#[derive(Default)]
pub struct Store {
    inner: Mutex<Versioned>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Versioned>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Start a flow on a private copy of the current database.
    pub fn begin(&self) -> Result<ObvContext, StoreError> {
        let guard = self.lock()?;
        Ok(ObvContext::new(guard.db.clone(), guard.version))
    }

    /// Publish a flow. Flows that never touched the database commit without
    /// a version check; the others fail with [`StoreError::CommitConflict`]
    /// if any flow committed since they began.
    pub fn commit(&self, ctx: ObvContext) -> Result<FlowEffects, StoreError> {
        let parts = ctx.into_parts();
        if !parts.dirty {
            return Ok(parts.effects);
        }
        let mut guard = self.lock()?;
        if guard.version != parts.base_version {
            debug!(flow = %parts.flow_id, base = parts.base_version, current = guard.version, "commit conflict");
            return Err(StoreError::CommitConflict {
                flow_id: parts.flow_id,
            });
        }
        guard.db = parts.db;
        guard.version += 1;
        trace!(flow = %parts.flow_id, version = guard.version, "flow committed");
        Ok(parts.effects)
    }

    /// Run `f` against the committed database.
    pub fn read<R>(&self, f: impl FnOnce(&Database) -> R) -> Result<R, StoreError> {
        let guard = self.lock()?;
        Ok(f(&guard.db))
    }

    pub fn version(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.version)
    }

    /// Encrypt the committed database for storage on disk.
    pub fn export_snapshot(&self, password: &str) -> Result<Vec<u8>, StoreError> {
        let guard = self.lock()?;
        let blob = seal_blob(&guard.db, password)?;
        info!(bytes = blob.len(), instances = guard.db.instances.len(), "exported store snapshot");
        Ok(blob)
    }

    /// Rebuild a store from [`Store::export_snapshot`] output.
    pub fn import_snapshot(blob: &[u8], password: &str) -> Result<Self, StoreError> {
        let db: Database = open_blob(blob, password)?;
        info!(instances = db.instances.len(), channels = db.channels.len(), "imported store snapshot");
        Ok(Self {
            inner: Mutex::new(Versioned { version: 0, db }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{channel_creation, ProtocolState};
    use obvchan_protocol::{CryptoIdentity, InstanceId, ProtocolKind, Uid, UID_LEN};

    fn identity(tag: u8) -> CryptoIdentity {
        CryptoIdentity {
            signing_key: [tag; 32],
            encryption_key: [tag; 32],
        }
    }

    fn instance_key() -> InstanceKey {
        InstanceKey {
            protocol: ProtocolKind::ChannelCreationWithContactDevice,
            instance_id: InstanceId::random(),
            owner: identity(1),
        }
    }

    fn ping_sent() -> ProtocolState {
        ProtocolState::ChannelCreation(channel_creation::State::PingSent {
            contact: identity(2),
            contact_device: Uid([2u8; UID_LEN]),
        })
    }

    #[test]
    fn committed_flow_is_visible() {
        let store = Store::new();
        let key = instance_key();
        let mut ctx = store.begin().unwrap();
        ctx.db_mut().instances.create(key, ping_sent()).unwrap();
        store.commit(ctx).unwrap();

        assert!(store.read(|db| db.instances.contains(&key)).unwrap());
        assert_eq!(store.version().unwrap(), 1);
    }

    #[test]
    fn dropped_flow_leaves_no_trace() {
        let store = Store::new();
        let mut ctx = store.begin().unwrap();
        ctx.db_mut().instances.create(instance_key(), ping_sent()).unwrap();
        drop(ctx);
        assert!(store.read(|db| db.instances.is_empty()).unwrap());
    }

    #[test]
    fn concurrent_writers_conflict() {
        let store = Store::new();
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        first.db_mut().instances.create(instance_key(), ping_sent()).unwrap();
        second.db_mut().instances.create(instance_key(), ping_sent()).unwrap();

        store.commit(first).unwrap();
        assert!(matches!(
            store.commit(second),
            Err(StoreError::CommitConflict { .. })
        ));
        assert_eq!(store.read(|db| db.instances.len()).unwrap(), 1);
    }

    #[test]
    fn read_only_flow_never_conflicts() {
        let store = Store::new();
        let reader = store.begin().unwrap();
        let mut writer = store.begin().unwrap();
        writer.db_mut().instances.create(instance_key(), ping_sent()).unwrap();
        store.commit(writer).unwrap();
        assert!(store.commit(reader).is_ok());
    }

    #[test]
    fn delete_instance_cascades() {
        let mut db = Database::default();
        let key = instance_key();
        db.instances.create(key, ping_sent()).unwrap();
        db.channel_creation
            .register(key.owner, identity(2), Uid([2u8; UID_LEN]), key.instance_id);
        db.waiting.create(WaitingForCondition {
            owner: key.owner,
            watched_contact: identity(2),
            instance: key,
            replay_body: vec![],
        });

        assert!(db.delete_instance(&key));
        assert!(db.instances.is_empty());
        assert!(db.waiting.is_empty());
        assert!(db.channel_creation.is_empty());
        assert!(!db.delete_instance(&key));
    }

    #[test]
    fn snapshot_roundtrip() {
        let store = Store::new();
        let key = instance_key();
        let mut ctx = store.begin().unwrap();
        ctx.db_mut().instances.create(key, ping_sent()).unwrap();
        store.commit(ctx).unwrap();

        let blob = store.export_snapshot("pw").unwrap();
        let restored = Store::import_snapshot(&blob, "pw").unwrap();
        assert!(restored.read(|db| db.instances.contains(&key)).unwrap());
        assert!(Store::import_snapshot(&blob, "other").is_err());
    }
}
