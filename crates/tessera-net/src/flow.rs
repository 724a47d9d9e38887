//! Per-peer admission control.
//!
//! Each peer has a window of at most `size` ack-requiring messages in
//! flight. The size follows the last observed round-trip time:
//!
//! | RTT             | window |
//! |-----------------|--------|
//! | < 50 ms         | 50     |
//! | 50 ms .. 200 ms | 25     |
//! | >= 200 ms       | 10     |
//!
//! A single sample changes the window. Callers that own a worker thread can
//! block in [`FlowController::wait_for_window`]; each ack wakes one waiter.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::messages::PeerId;
use crate::sync::lock;

/// Smallest window a peer can be throttled to.
pub const MIN_WINDOW: usize = 5;
/// Largest window a peer can be granted.
pub const MAX_WINDOW: usize = 50;
/// Window granted to a peer before its first ack.
pub const INITIAL_WINDOW: usize = 25;

const FAST_RTT: Duration = Duration::from_millis(50);
const SLOW_RTT: Duration = Duration::from_millis(200);

/// Window size for one RTT sample, before clamping.
pub fn window_for_rtt(rtt: Duration) -> usize {
    let size = if rtt < FAST_RTT {
        50
    } else if rtt < SLOW_RTT {
        25
    } else {
        10
    };
    size.clamp(MIN_WINDOW, MAX_WINDOW)
}

/// Snapshot of one peer's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Admission limit, within `[MIN_WINDOW, MAX_WINDOW]`.
    pub size: usize,
    /// Ack-requiring messages sent and not yet acknowledged.
    pub in_flight: usize,
    /// Last RTT sample, if any.
    pub last_rtt: Option<Duration>,
}

impl WindowState {
    fn new(size: usize) -> Self {
        Self {
            size,
            in_flight: 0,
            last_rtt: None,
        }
    }

    fn has_room(&self) -> bool {
        self.in_flight < self.size
    }
}

struct PeerWindow {
    state: Mutex<WindowState>,
    opened: Condvar,
    /// Set under `state` when the peer is forgotten.
    retired: AtomicBool,
}

/// Per-peer sliding windows.
pub struct FlowController {
    initial_window: usize,
    peers: Mutex<HashMap<PeerId, Arc<PeerWindow>>>,
}

impl FlowController {
    /// Create a controller granting `initial_window` to unseen peers.
    pub fn new(initial_window: usize) -> Self {
        Self {
            initial_window: initial_window.clamp(MIN_WINDOW, MAX_WINDOW),
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self, peer: PeerId) -> Arc<PeerWindow> {
        let mut peers = lock(&self.peers);
        Arc::clone(peers.entry(peer).or_insert_with(|| {
            Arc::new(PeerWindow {
                state: Mutex::new(WindowState::new(self.initial_window)),
                opened: Condvar::new(),
                retired: AtomicBool::new(false),
            })
        }))
    }

    fn existing(&self, peer: PeerId) -> Option<Arc<PeerWindow>> {
        lock(&self.peers).get(&peer).cloned()
    }

    /// Whether another ack-requiring message may be sent to `peer`.
    pub fn can_send(&self, peer: PeerId) -> bool {
        self.existing(peer)
            .is_none_or(|w| lock(&w.state).has_room())
    }

    /// Count one message as in flight.
    pub fn on_sent(&self, peer: PeerId) {
        let window = self.window(peer);
        lock(&window.state).in_flight += 1;
    }

    /// Release one in-flight slot and resize the window from `rtt`.
    pub fn on_ack(&self, peer: PeerId, rtt: Duration) {
        let window = self.window(peer);
        {
            let mut state = lock(&window.state);
            state.in_flight = state.in_flight.saturating_sub(1);
            let size = window_for_rtt(rtt);
            if size != state.size {
                tracing::debug!(
                    %peer,
                    rtt_ms = rtt.as_millis() as u64,
                    from = state.size,
                    to = size,
                    "window resized"
                );
            }
            state.size = size;
            state.last_rtt = Some(rtt);
        }
        window.opened.notify_one();
    }

    /// Block the calling worker thread until `peer` has room or `timeout`
    /// elapses. Returns whether there is room.
    ///
    /// Never call this from the I/O reactor.
    pub fn wait_for_window(&self, peer: PeerId, timeout: Duration) -> bool {
        let window = self.window(peer);
        let deadline = Instant::now() + timeout;
        let mut state = lock(&window.state);
        while !state.has_room() {
            if window.retired.load(Ordering::Acquire) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = match window.opened.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        !window.retired.load(Ordering::Acquire)
    }

    /// Current window for `peer` (the initial window if unseen).
    pub fn state(&self, peer: PeerId) -> WindowState {
        self.existing(peer)
            .map_or(WindowState::new(self.initial_window), |w| *lock(&w.state))
    }

    /// Current admission limit for `peer`.
    pub fn window_size(&self, peer: PeerId) -> usize {
        self.state(peer).size
    }

    /// Messages in flight to `peer`.
    pub fn in_flight(&self, peer: PeerId) -> usize {
        self.state(peer).in_flight
    }

    /// Last RTT sample for `peer`.
    pub fn last_rtt(&self, peer: PeerId) -> Option<Duration> {
        self.state(peer).last_rtt
    }

    /// Drop `peer`'s window and wake anyone waiting on it.
    pub fn forget(&self, peer: PeerId) {
        let removed = lock(&self.peers).remove(&peer);
        if let Some(window) = removed {
            {
                let _state = lock(&window.state);
                window.retired.store(true, Ordering::Release);
            }
            window.opened.notify_all();
        }
    }

    /// Human-readable summary with utilisation per peer.
    pub fn report(&self) -> String {
        let peers = lock(&self.peers);
        let mut ids: Vec<_> = peers.keys().copied().collect();
        ids.sort();

        let mut out = String::from("Flow control:\n");
        for id in ids {
            let state = *lock(&peers[&id].state);
            let _ = writeln!(
                out,
                "  {id}: window={}, in_flight={}, utilisation={:.0}%, rtt={}",
                state.size,
                state.in_flight,
                state.in_flight as f64 / state.size as f64 * 100.0,
                state
                    .last_rtt
                    .map_or_else(|| "-".to_string(), |r| format!("{}ms", r.as_millis())),
            );
        }
        out
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(INITIAL_WINDOW)
    }
}
