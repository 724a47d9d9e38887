//! Passive per-peer reliability metrics.
//!
//! Counters are atomics so write-completion callbacks and reader tasks can
//! bump them without locking. Nothing here feeds back into protocol state.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::messages::PeerId;
use crate::sync::{read, write};

/// Loss rate at or above which a peer is unhealthy.
pub const MAX_HEALTHY_LOSS_RATE: f64 = 0.05;
/// Average RTT at or above which a peer is unhealthy.
pub const MAX_HEALTHY_RTT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// PeerCounters
// ---------------------------------------------------------------------------

/// Live counters for one peer.
#[derive(Default)]
pub struct PeerCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_lost: AtomicU64,
    messages_resent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    write_failures: AtomicU64,
    rtt_samples: AtomicU64,
    rtt_total_micros: AtomicU64,
    rtt_max_micros: AtomicU64,
}

impl PeerCounters {
    /// Record an outgoing message of `bytes` wire bytes.
    pub fn record_send(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an incoming message of `bytes` wire bytes.
    pub fn record_receive(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record `count` messages detected as missing.
    pub fn record_lost(&self, count: u64) {
        self.messages_lost.fetch_add(count, Ordering::Relaxed);
    }

    /// Record `count` retransmitted messages.
    pub fn record_resent(&self, count: u64) {
        self.messages_resent.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a failed transport write.
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one RTT sample into the running average and maximum.
    pub fn record_rtt(&self, rtt: Duration) {
        let micros = rtt.as_micros().min(u64::MAX as u128) as u64;
        self.rtt_samples.fetch_add(1, Ordering::Relaxed);
        self.rtt_total_micros.fetch_add(micros, Ordering::Relaxed);
        self.rtt_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    /// Running average RTT over every sample so far.
    pub fn average_rtt(&self) -> Duration {
        let samples = self.rtt_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.rtt_total_micros.load(Ordering::Relaxed) / samples)
    }

    /// Lost messages as a fraction of messages sent.
    pub fn loss_rate(&self) -> f64 {
        let sent = self.messages_sent.load(Ordering::Relaxed);
        if sent == 0 {
            return 0.0;
        }
        self.messages_lost.load(Ordering::Relaxed) as f64 / sent as f64
    }

    /// Loss below 5% and average RTT below 500 ms.
    pub fn is_healthy(&self) -> bool {
        self.loss_rate() < MAX_HEALTHY_LOSS_RATE && self.average_rtt() < MAX_HEALTHY_RTT
    }

    /// Point-in-time copy of these counters.
    pub fn snapshot(&self, peer_id: PeerId) -> HealthSnapshot {
        let average_rtt = self.average_rtt();
        HealthSnapshot {
            peer_id,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_lost: self.messages_lost.load(Ordering::Relaxed),
            messages_resent: self.messages_resent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            average_rtt_ms: average_rtt.as_secs_f64() * 1000.0,
            max_rtt_ms: self.rtt_max_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            loss_rate: self.loss_rate(),
            healthy: self.is_healthy(),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthSnapshot
// ---------------------------------------------------------------------------

/// Structured view of one peer's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Peer the counters belong to.
    pub peer_id: PeerId,
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Messages detected as missing.
    pub messages_lost: u64,
    /// Messages retransmitted.
    pub messages_resent: u64,
    /// Wire bytes sent.
    pub bytes_sent: u64,
    /// Wire bytes received.
    pub bytes_received: u64,
    /// Failed transport writes.
    pub write_failures: u64,
    /// Running average RTT in milliseconds.
    pub average_rtt_ms: f64,
    /// Largest RTT sample in milliseconds.
    pub max_rtt_ms: f64,
    /// `messages_lost / messages_sent`.
    pub loss_rate: f64,
    /// Whether the peer passes the health predicate.
    pub healthy: bool,
}

impl fmt::Display for HealthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: sent={} recv={} lost={} resent={} loss={:.1}% rtt={:.1}ms (max {:.1}ms) write_failures={} [{}]",
            self.peer_id,
            self.messages_sent,
            self.messages_received,
            self.messages_lost,
            self.messages_resent,
            self.loss_rate * 100.0,
            self.average_rtt_ms,
            self.max_rtt_ms,
            self.write_failures,
            if self.healthy { "healthy" } else { "DEGRADED" },
        )
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Metrics for every known peer.
pub struct MetricsCollector {
    started: RwLock<Instant>,
    peers: RwLock<HashMap<PeerId, Arc<PeerCounters>>>,
}

impl MetricsCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            started: RwLock::new(Instant::now()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Counters for `peer`, created on first use.
    pub fn counters(&self, peer: PeerId) -> Arc<PeerCounters> {
        if let Some(counters) = read(&self.peers).get(&peer) {
            return Arc::clone(counters);
        }
        Arc::clone(write(&self.peers).entry(peer).or_default())
    }

    /// Record an outgoing message.
    pub fn record_send(&self, peer: PeerId, bytes: u64) {
        self.counters(peer).record_send(bytes);
    }

    /// Record an incoming message.
    pub fn record_receive(&self, peer: PeerId, bytes: u64) {
        self.counters(peer).record_receive(bytes);
    }

    /// Record missing messages.
    pub fn record_lost(&self, peer: PeerId, count: u64) {
        self.counters(peer).record_lost(count);
    }

    /// Record retransmitted messages.
    pub fn record_resent(&self, peer: PeerId, count: u64) {
        self.counters(peer).record_resent(count);
    }

    /// Record one RTT sample.
    pub fn record_rtt(&self, peer: PeerId, rtt: Duration) {
        self.counters(peer).record_rtt(rtt);
    }

    /// Snapshot for one peer, if it has any metrics.
    pub fn health_snapshot(&self, peer: PeerId) -> Option<HealthSnapshot> {
        read(&self.peers).get(&peer).map(|c| c.snapshot(peer))
    }

    /// Snapshots for every peer, ordered by id.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<_> = read(&self.peers)
            .iter()
            .map(|(&id, c)| c.snapshot(id))
            .collect();
        snapshots.sort_by_key(|s| s.peer_id);
        snapshots
    }

    /// Time since creation or the last [`reset`](Self::reset).
    pub fn uptime(&self) -> Duration {
        read(&self.started).elapsed()
    }

    /// Human-readable report across all peers.
    pub fn report(&self) -> String {
        let uptime = self.uptime();
        let secs = uptime.as_secs_f64().max(f64::EPSILON);
        let mut out = format!("Metrics (uptime {}s):\n", uptime.as_secs());
        for snapshot in self.snapshots() {
            let _ = writeln!(
                out,
                "  {snapshot} out={:.1}kbps in={:.1}kbps",
                snapshot.bytes_sent as f64 * 8.0 / 1000.0 / secs,
                snapshot.bytes_received as f64 * 8.0 / 1000.0 / secs,
            );
        }
        out
    }

    /// Every snapshot as a JSON document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Export {
            uptime_secs: u64,
            peers: Vec<HealthSnapshot>,
        }
        serde_json::to_string(&Export {
            uptime_secs: self.uptime().as_secs(),
            peers: self.snapshots(),
        })
    }

    /// Drop `peer`'s counters.
    pub fn forget(&self, peer: PeerId) {
        write(&self.peers).remove(&peer);
    }

    /// Drop every counter and restart the uptime clock.
    pub fn reset(&self) {
        write(&self.peers).clear();
        *write(&self.started) = Instant::now();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
