//! Correlation of requests with their replies.
//!
//! Register an id with [`ReplyPool::initialize`] *before* the request goes
//! out, then block a worker thread in [`ReplyPool::get`]. Each pending id is
//! terminated exactly once: by a reply, by its deadline, or by
//! [`ReplyPool::cancel_all`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::sync::lock;

/// Base wait before a reply is considered lost. Default: 10 minutes.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// Why [`ReplyPool::get`] returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    /// No reply within the scaled deadline.
    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    /// The id was never registered, or is already being waited on.
    #[error("correlation id is not pending")]
    NotPending,

    /// The pool was cancelled while waiting.
    #[error("reply cancelled")]
    Cancelled,
}

impl ReplyError {
    /// Whether the caller should treat the peer as unresponsive.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::NotPending)
    }
}

enum Outcome<T> {
    Value(T),
    Cancelled,
}

struct Slot<T> {
    /// Taken by the completing side.
    tx: Option<Sender<Outcome<T>>>,
    /// Taken by the waiting side.
    rx: Option<Receiver<Outcome<T>>>,
}

/// Table of pending replies with a scalable deadline.
pub struct ReplyPool<T> {
    slots: Mutex<HashMap<u64, Slot<T>>>,
    base_timeout: Duration,
    multiplier: AtomicU32,
}

impl<T: Send> ReplyPool<T> {
    /// Create a pool with the default 10 minute base timeout.
    pub fn new() -> Self {
        Self::with_base_timeout(DEFAULT_REPLY_TIMEOUT)
    }

    /// Create a pool with a custom base timeout.
    pub fn with_base_timeout(base_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            base_timeout,
            multiplier: AtomicU32::new(1),
        }
    }

    /// Register `id` so a reply arriving before `get` is not lost.
    pub fn initialize(&self, id: u64) {
        let (tx, rx) = bounded(1);
        let previous = lock(&self.slots).insert(
            id,
            Slot {
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        if previous.is_some() {
            tracing::warn!(id, "correlation id re-registered, previous waiter dropped");
        }
    }

    /// Resolve `id` with `value`. Returns `false` (and does nothing) if the
    /// id is unknown or already completed.
    pub fn complete(&self, id: u64, value: T) -> bool {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&id) else {
            tracing::debug!(id, "reply for unknown correlation id ignored");
            return false;
        };
        let Some(tx) = slot.tx.take() else {
            tracing::debug!(id, "duplicate reply ignored");
            return false;
        };
        let _ = tx.try_send(Outcome::Value(value));
        if slot.rx.is_none() {
            // A waiter holds the receiver and will collect the value.
            slots.remove(&id);
        }
        true
    }

    /// Block until `id` is completed, cancelled or the scaled deadline
    /// passes. The entry is removed on return.
    ///
    /// Never call this from the I/O reactor.
    pub fn get(&self, id: u64) -> Result<T, ReplyError> {
        let rx = {
            let mut slots = lock(&self.slots);
            let Some(rx) = slots.get_mut(&id).and_then(|s| s.rx.take()) else {
                return Err(ReplyError::NotPending);
            };
            if slots.get(&id).is_some_and(|s| s.tx.is_none()) {
                // Already completed; the value is waiting in the channel.
                slots.remove(&id);
            }
            rx
        };

        let timeout = self.timeout();
        let result = match rx.recv_timeout(timeout) {
            Ok(Outcome::Value(value)) => Ok(value),
            Ok(Outcome::Cancelled) | Err(RecvTimeoutError::Disconnected) => {
                Err(ReplyError::Cancelled)
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(id, ?timeout, "reply timed out");
                Err(ReplyError::TimedOut(timeout))
            }
        };

        let mut slots = lock(&self.slots);
        if slots.get(&id).is_some_and(|s| s.rx.is_none()) {
            slots.remove(&id);
        }
        result
    }

    /// Scale the deadline of subsequent waits by `multiplier` (at least 1).
    pub fn set_timeout_multiplier(&self, multiplier: u32) {
        self.multiplier.store(multiplier.max(1), Ordering::Release);
    }

    /// Current multiplier.
    pub fn timeout_multiplier(&self) -> u32 {
        self.multiplier.load(Ordering::Acquire)
    }

    /// The deadline applied by `get`: base timeout times multiplier.
    pub fn timeout(&self) -> Duration {
        self.base_timeout * self.timeout_multiplier()
    }

    /// Terminate every pending id with [`ReplyError::Cancelled`] and empty
    /// the table. Returns the number of entries cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.slots).drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            if let Some(tx) = slot.tx {
                let _ = tx.try_send(Outcome::Cancelled);
            }
        }
        if count > 0 {
            tracing::info!(count, "pending replies cancelled");
        }
        count
    }

    /// Drop `id` without completing it, e.g. when its request could not be
    /// written. Returns whether it was pending.
    pub fn discard(&self, id: u64) -> bool {
        lock(&self.slots).remove(&id).is_some()
    }

    /// Ids registered and not yet terminated.
    pub fn pending_count(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Ids a caller is currently blocked on.
    pub fn awaiting_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|s| s.rx.is_none())
            .count()
    }
}

impl<T: Send> Default for ReplyPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
