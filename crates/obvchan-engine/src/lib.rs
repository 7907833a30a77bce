//! Oblivious channel establishment and encrypted message dispatch.
//!
//! The crate is organised around one [`ProtocolManager`] per device process:
//! - [`store`]: durable protocol instances, waiting-for-condition entries,
//!   replay guard, channels and pre-keys, with optimistic flow transactions
//! - [`context`]: the per-flow transactional context and its outbox
//! - [`protocol`]: the step engine and the concrete protocols run on it
//! - [`decryptor`]: inbound envelope unwrapping and routing
//! - [`memory`]: in-memory identity directory and network used by tests and
//!   the simulator

pub mod config;
pub mod context;
pub mod decryptor;
pub mod delegates;
pub mod error;
pub mod manager;
pub mod memory;
pub mod outbox;
pub mod protocol;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::EngineConfig;
pub use context::{ObvContext, ReceptionChannelInfo, SendChannel};
pub use decryptor::{DecryptionOutcome, Decryptor, ResolvedApplicationMessage};
pub use delegates::{IdentityDelegate, IdentityUpdate, Transport};
pub use error::{EngineError, IdentityError, StepError, StoreError, TransportError};
pub use manager::{ProtocolManager, ProtocolManagerBuilder};
pub use protocol::{DispatchOutcome, DropReason};
pub use store::Store;

/// Wall-clock time in ms since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
