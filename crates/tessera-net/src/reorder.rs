//! Receiver-side reordering of sequenced messages.
//!
//! Each sender gets its own buffer keyed by sequence number. [`ReorderBuffer::drain`]
//! releases the contiguous run starting right after the last delivered
//! sequence and stops at the first gap. Only sequences within a fixed window
//! ahead of the next expected one are buffered.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::messages::{PeerId, SequencedMessage};
use crate::sync::lock;

/// Default number of sequences past the next expected one that may be buffered.
pub const DEFAULT_REORDER_WINDOW: u64 = 1024;

/// What [`ReorderBuffer::accept`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Stored for delivery.
    Buffered,
    /// Already delivered or already buffered; dropped.
    Duplicate,
    /// Too far ahead of the next expected sequence; dropped.
    OutOfWindow,
}

/// Result of [`ReorderBuffer::skip_missing`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Skipped {
    /// Buffered payloads released in order, up to the new watermark and
    /// past it.
    pub payloads: Vec<Vec<u8>>,
    /// Missing sequences stepped over that were not already counted as lost.
    pub newly_lost: u64,
}

/// Counters for one sender stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Messages accepted, duplicates included.
    pub received: u64,
    /// Messages released by `drain`.
    pub delivered: u64,
    /// Messages dropped as duplicates.
    pub duplicates: u64,
    /// Messages currently buffered.
    pub pending: usize,
    /// Last delivered sequence.
    pub last_delivered: Option<u64>,
}

#[derive(Default)]
struct SenderBuffer {
    pending: BTreeMap<u64, SequencedMessage>,
    last_delivered: Option<u64>,
    /// When the current gap was first observed.
    gap_since: Option<Instant>,
    /// Highest missing sequence already reported as lost.
    lost_through: Option<u64>,
    received: u64,
    delivered: u64,
    duplicates: u64,
}

impl SenderBuffer {
    fn next_expected(&self) -> u64 {
        self.last_delivered.map_or(0, |s| s.saturating_add(1))
    }

    fn is_stale(&self, sequence: u64) -> bool {
        self.last_delivered.is_some_and(|d| sequence <= d)
    }

    /// Buffered entries exist but the next expected one is missing.
    fn has_gap(&self) -> bool {
        self.pending
            .first_key_value()
            .is_some_and(|(&first, _)| first != self.next_expected())
    }

    /// Release the contiguous run at the watermark.
    fn release(&mut self, released: &mut Vec<Vec<u8>>) {
        loop {
            let expected = self.next_expected();
            let Some(message) = self.pending.remove(&expected) else {
                break;
            };
            self.last_delivered = Some(expected);
            self.delivered += 1;
            released.push(message.payload);
        }
    }
}

/// Per-sender reorder buffers.
pub struct ReorderBuffer {
    window: u64,
    senders: Mutex<HashMap<PeerId, SenderBuffer>>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::with_window(DEFAULT_REORDER_WINDOW)
    }
}

impl ReorderBuffer {
    /// Create an empty buffer with the default window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer that holds at most `window` sequences ahead of
    /// each sender's watermark.
    pub fn with_window(window: u64) -> Self {
        Self {
            window: window.max(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Store `message` under its sender and sequence.
    pub fn accept(&self, message: SequencedMessage) -> Accepted {
        let sender = message.sender_id;
        let sequence = message.sequence;

        let mut senders = lock(&self.senders);
        let buffer = senders.entry(sender).or_default();
        buffer.received += 1;

        if buffer.is_stale(sequence) || buffer.pending.contains_key(&sequence) {
            buffer.duplicates += 1;
            tracing::debug!(%sender, sequence, "duplicate message dropped");
            return Accepted::Duplicate;
        }
        let expected = buffer.next_expected();
        if sequence - expected >= self.window {
            tracing::warn!(
                %sender,
                sequence,
                expected,
                window = self.window,
                "message beyond reorder window dropped"
            );
            return Accepted::OutOfWindow;
        }

        buffer.pending.insert(sequence, message);
        Accepted::Buffered
    }

    /// Remove and return every payload in the contiguous run starting at
    /// the next expected sequence.
    pub fn drain(&self, sender: PeerId) -> Vec<Vec<u8>> {
        let mut senders = lock(&self.senders);
        let Some(buffer) = senders.get_mut(&sender) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        buffer.release(&mut released);

        if buffer.has_gap() {
            if buffer.gap_since.is_none() || !released.is_empty() {
                buffer.gap_since = Some(Instant::now());
                if let Some((&first, _)) = buffer.pending.first_key_value() {
                    tracing::debug!(
                        %sender,
                        expected = buffer.next_expected(),
                        buffered_from = first,
                        "sequence gap"
                    );
                }
            }
        } else {
            buffer.gap_since = None;
        }
        released
    }

    /// Senders whose gap has been open for at least `older_than`, paired
    /// with the first missing sequence.
    pub fn stalled(&self, older_than: Duration) -> Vec<(PeerId, u64)> {
        let senders = lock(&self.senders);
        let mut stalled: Vec<_> = senders
            .iter()
            .filter(|(_, b)| b.has_gap())
            .filter(|(_, b)| b.gap_since.is_some_and(|t| t.elapsed() >= older_than))
            .map(|(&id, b)| (id, b.next_expected()))
            .collect();
        stalled.sort();
        stalled
    }

    /// Number of sequences missing in front of the buffered run.
    pub fn gap_len(&self, sender: PeerId) -> u64 {
        lock(&self.senders).get(&sender).map_or(0, |b| {
            b.pending
                .first_key_value()
                .map_or(0, |(&first, _)| first.saturating_sub(b.next_expected()))
        })
    }

    /// Missing sequences in front of `sender`'s buffered run that have not
    /// been reported yet. Each sequence is reported once, even when the gap
    /// is detected again.
    pub fn claim_missing(&self, sender: PeerId) -> u64 {
        let mut senders = lock(&self.senders);
        let Some(buffer) = senders.get_mut(&sender) else {
            return 0;
        };
        let Some((&first, _)) = buffer.pending.first_key_value() else {
            return 0;
        };
        let start = buffer
            .next_expected()
            .max(buffer.lost_through.map_or(0, |t| t.saturating_add(1)));
        if first <= start {
            return 0;
        }
        buffer.lost_through = Some(first - 1);
        first - start
    }

    /// Give up on every missing sequence up to and including `through`.
    /// Buffered messages in that range are still released in order; the
    /// holes are stepped over.
    pub fn skip_missing(&self, sender: PeerId, through: u64) -> Skipped {
        let mut senders = lock(&self.senders);
        let buffer = senders.entry(sender).or_default();
        let mut skipped = Skipped::default();

        loop {
            buffer.release(&mut skipped.payloads);
            let hole = buffer.next_expected();
            if hole > through {
                break;
            }
            // The hole runs up to the next buffered sequence.
            let end = buffer
                .pending
                .first_key_value()
                .map_or(through, |(&next, _)| (next - 1).min(through));
            let uncounted_from = hole.max(buffer.lost_through.map_or(0, |t| t.saturating_add(1)));
            if end >= uncounted_from {
                skipped.newly_lost += end - uncounted_from + 1;
                buffer.lost_through = Some(end);
            }
            buffer.last_delivered = Some(end);
            if end == through {
                break;
            }
        }
        buffer.release(&mut skipped.payloads);
        buffer.gap_since = buffer.has_gap().then(Instant::now);
        skipped
    }

    /// Restart the age of `sender`'s gap, e.g. after asking for a resend.
    pub fn touch_gap(&self, sender: PeerId) {
        if let Some(buffer) = lock(&self.senders).get_mut(&sender)
            && buffer.has_gap()
        {
            buffer.gap_since = Some(Instant::now());
        }
    }

    /// Force the watermark up to `sequence`, dropping anything buffered at
    /// or below it.
    pub fn mark_processed(&self, sender: PeerId, sequence: u64) {
        let mut senders = lock(&self.senders);
        let buffer = senders.entry(sender).or_default();
        if buffer.is_stale(sequence) {
            return;
        }
        buffer.last_delivered = Some(sequence);
        buffer.pending = buffer.pending.split_off(&sequence.saturating_add(1));
        buffer.gap_since = buffer.has_gap().then(Instant::now);
    }

    /// The sequence reported in the next ack to `sender`.
    pub fn last_delivered(&self, sender: PeerId) -> Option<u64> {
        lock(&self.senders)
            .get(&sender)
            .and_then(|b| b.last_delivered)
    }

    /// The sequence `drain` will release next.
    pub fn next_expected(&self, sender: PeerId) -> u64 {
        lock(&self.senders)
            .get(&sender)
            .map_or(0, SenderBuffer::next_expected)
    }

    /// Messages buffered for `sender`.
    pub fn pending_count(&self, sender: PeerId) -> usize {
        lock(&self.senders)
            .get(&sender)
            .map_or(0, |b| b.pending.len())
    }

    /// Whether anything is buffered for any sender.
    pub fn has_pending(&self) -> bool {
        lock(&self.senders).values().any(|b| !b.pending.is_empty())
    }

    /// Drop all state kept for `sender`.
    pub fn forget(&self, sender: PeerId) {
        if let Some(buffer) = lock(&self.senders).remove(&sender)
            && !buffer.pending.is_empty()
        {
            tracing::debug!(%sender, dropped = buffer.pending.len(), "reorder buffer cleared");
        }
    }

    /// Counters for one sender stream.
    pub fn stats(&self, sender: PeerId) -> Option<ReorderStats> {
        lock(&self.senders).get(&sender).map(|b| ReorderStats {
            received: b.received,
            delivered: b.delivered,
            duplicates: b.duplicates,
            pending: b.pending.len(),
            last_delivered: b.last_delivered,
        })
    }

    /// Human-readable summary of every sender stream.
    pub fn report(&self) -> String {
        let senders = lock(&self.senders);
        let mut ids: Vec<_> = senders.keys().copied().collect();
        ids.sort();

        let mut out = String::from("Reorder buffer:\n");
        for id in ids {
            let b = &senders[&id];
            let _ = writeln!(
                out,
                "  {id}: expected={}, pending={}, received={}, delivered={}, duplicates={}",
                b.next_expected(),
                b.pending.len(),
                b.received,
                b.delivered,
                b.duplicates,
            );
        }
        out
    }
}
