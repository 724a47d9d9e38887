//! Stand-in rule engine that logs what the reliability layer hands it.

use std::sync::atomic::{AtomicU64, Ordering};

use tessera_net::{EventSink, PeerId, PeerState};
use tracing::{debug, info, warn};

/// Logs every delivery and lifecycle event and echoes requests back.
#[derive(Default)]
pub struct LoggingSink {
    delivered: AtomicU64,
    requests: AtomicU64,
}

impl LoggingSink {
    /// Payloads delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Requests answered so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl EventSink for LoggingSink {
    fn deliver(&self, from: PeerId, payload: Vec<u8>) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!("{from} delivered {} bytes", payload.len());
    }

    fn on_request(&self, from: PeerId, payload: Vec<u8>) -> Option<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!("{from} requested {} bytes, echoing", payload.len());
        Some(payload)
    }

    fn on_peer_connected(&self, peer: PeerId) {
        info!("{peer} connected");
    }

    fn on_peer_disconnected(&self, peer: PeerId, state: PeerState) {
        match state {
            PeerState::Failed => warn!("{peer} failed to reconnect in time"),
            _ => info!("{peer} disconnected"),
        }
    }
}
