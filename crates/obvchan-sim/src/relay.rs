//! Stand-in for the relay server: stamps envelopes, frames them and pushes
//! the frames to the recipient device's task.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use obvchan_engine::{unix_millis, Transport, TransportError};
use obvchan_protocol::codec::encode_frame;
use obvchan_protocol::{CryptoIdentity, DialogMessage, OutboundEnvelope, Uid};
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

#[derive(Default)]
pub struct Relay {
    frames: DashMap<Uid, mpsc::UnboundedSender<Vec<u8>>>,
    dialogs: DashMap<CryptoIdentity, mpsc::UnboundedSender<DialogMessage>>,
    /// Frames and dialogs posted but not yet fully handled by their device.
    in_flight: AtomicI64,
    posted: AtomicU64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; returns the receiving ends its task reads from.
    pub fn connect(
        &self,
        device: Uid,
        owner: CryptoIdentity,
    ) -> (
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedReceiver<DialogMessage>,
    ) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (dialog_tx, dialog_rx) = mpsc::unbounded_channel();
        self.frames.insert(device, frame_tx);
        self.dialogs.insert(owner, dialog_tx);
        (frame_rx, dialog_rx)
    }

    /// Called by a device task once it is done with a frame or dialog.
    pub fn handled(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    pub fn posted_count(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn disconnect_all(&self) {
        self.frames.clear();
        self.dialogs.clear();
    }
}

impl Transport for Relay {
    fn post_envelope(&self, flow_id: Uuid, envelope: OutboundEnvelope) -> Result<(), TransportError> {
        let now = unix_millis();
        let device = envelope.to_device;
        let frame = encode_frame(&envelope.into_inbound(now, now))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let Some(route) = self.frames.get(&device) else {
            warn!(flow = %flow_id, %device, "no route to device");
            return Err(TransportError::Other(format!("no route to device {}", device)));
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if route.send(frame).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Closed);
        }
        self.posted.fetch_add(1, Ordering::Relaxed);
        trace!(flow = %flow_id, %device, "frame relayed");
        Ok(())
    }

    fn post_dialog(&self, owner: &CryptoIdentity, dialog: DialogMessage) -> Result<(), TransportError> {
        let Some(route) = self.dialogs.get(owner) else {
            return Err(TransportError::Other(format!("no user interface for {}", owner)));
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if route.send(dialog).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}
