//! Sender-side sequencing and acknowledgment tracking.
//!
//! [`Sequencer`] stamps each outgoing payload with the next per-recipient
//! sequence number (0, 1, 2, ...), keeps a bounded history of what was sent
//! for retransmission, and advances a cumulative watermark as acks arrive.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::messages::{PeerId, SequencedMessage, now_millis};
use crate::sync::lock;

/// Default number of sent messages retained per recipient.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Result of applying a cumulative ack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Newly covered written messages that had `requires_ack` set.
    pub newly_acked: usize,
    /// Time since the newest of those messages was first written.
    pub rtt: Option<Duration>,
}

/// Counters for one recipient stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerStats {
    /// Sequence number the next message will receive.
    pub next_sequence: u64,
    /// Highest acknowledged sequence, if any.
    pub acknowledged: Option<u64>,
    /// Messages in history above the watermark.
    pub unacknowledged: usize,
    /// Messages sequenced.
    pub sent: u64,
    /// Acks applied (including stale ones).
    pub acks_received: u64,
    /// Messages handed out again for retransmission.
    pub resent: u64,
}

#[derive(Default)]
struct RecipientLog {
    next_sequence: u64,
    history: VecDeque<SequencedMessage>,
    acknowledged: Option<u64>,
    /// (sequence, write instant) of ack-requiring messages written but not
    /// yet acknowledged, in sequence order.
    awaiting: VecDeque<(u64, Instant)>,
    sent: u64,
    acks_received: u64,
    resent: u64,
}

impl RecipientLog {
    fn unacknowledged(&self) -> impl Iterator<Item = &SequencedMessage> {
        let watermark = self.acknowledged;
        self.history
            .iter()
            .filter(move |m| watermark.is_none_or(|w| m.sequence > w))
    }
}

/// Assigns per-recipient sequence numbers and tracks acknowledgments.
pub struct Sequencer {
    local_id: AtomicU64,
    next_global_id: AtomicU64,
    history_capacity: usize,
    recipients: Mutex<HashMap<PeerId, RecipientLog>>,
}

impl Sequencer {
    /// Create a sequencer stamping messages with `local_id`.
    pub fn new(local_id: PeerId, history_capacity: usize) -> Self {
        Self {
            local_id: AtomicU64::new(local_id.0),
            next_global_id: AtomicU64::new(1),
            history_capacity: history_capacity.max(1),
            recipients: Mutex::new(HashMap::new()),
        }
    }

    /// Id written into `sender_id` of every sequenced message.
    pub fn local_id(&self) -> PeerId {
        PeerId(self.local_id.load(Ordering::Acquire))
    }

    /// Replace the local id, e.g. once a host has assigned one.
    pub fn set_local_id(&self, id: PeerId) {
        self.local_id.store(id.0, Ordering::Release);
    }

    /// Wrap `payload` with the next sequence number for `recipient` and
    /// record it in the bounded history.
    pub fn sequence(
        &self,
        payload: Vec<u8>,
        recipient: PeerId,
        requires_ack: bool,
    ) -> SequencedMessage {
        let mut recipients = lock(&self.recipients);
        let log = recipients.entry(recipient).or_default();

        let sequence = log.next_sequence;
        log.next_sequence += 1;
        log.sent += 1;

        let message = SequencedMessage {
            global_id: self.next_global_id.fetch_add(1, Ordering::Relaxed),
            sender_id: self.local_id(),
            sequence,
            timestamp_ms: now_millis(),
            requires_ack,
            payload,
        };

        log.history.push_back(message.clone());
        if log.history.len() > self.history_capacity
            && let Some(evicted) = log.history.pop_front()
            && log.acknowledged.is_none_or(|w| evicted.sequence > w)
        {
            tracing::debug!(
                %recipient,
                sequence = evicted.sequence,
                "unacknowledged message evicted from history"
            );
        }

        tracing::trace!(%recipient, sequence, requires_ack, "sequenced message");
        message
    }

    /// Start the round-trip clock of an ack-requiring message as it goes out
    /// for the first time. Retransmissions keep their original stamp.
    pub fn mark_written(&self, recipient: PeerId, sequence: u64) {
        let mut recipients = lock(&self.recipients);
        let Some(log) = recipients.get_mut(&recipient) else {
            return;
        };
        if log.acknowledged.is_some_and(|w| sequence <= w)
            || log.awaiting.back().is_some_and(|&(last, _)| last >= sequence)
        {
            return;
        }
        log.awaiting.push_back((sequence, Instant::now()));
    }

    /// Apply a cumulative ack from `recipient` covering `0..=last_processed`.
    pub fn on_ack(&self, recipient: PeerId, last_processed: u64) -> AckOutcome {
        let mut recipients = lock(&self.recipients);
        let Some(log) = recipients.get_mut(&recipient) else {
            tracing::debug!(%recipient, last_processed, "ack for unknown recipient ignored");
            return AckOutcome::default();
        };
        log.acks_received += 1;

        if last_processed >= log.next_sequence {
            tracing::warn!(
                %recipient,
                last_processed,
                next = log.next_sequence,
                "ack beyond last issued sequence ignored"
            );
            return AckOutcome::default();
        }
        if log.acknowledged.is_some_and(|w| last_processed <= w) {
            return AckOutcome::default();
        }

        let previous = log.acknowledged.replace(last_processed);
        while log
            .history
            .front()
            .is_some_and(|m| m.sequence <= last_processed)
        {
            log.history.pop_front();
        }

        let mut outcome = AckOutcome::default();
        let mut newest_sent = None;
        while let Some(&(sequence, sent_at)) = log.awaiting.front() {
            if sequence > last_processed {
                break;
            }
            log.awaiting.pop_front();
            outcome.newly_acked += 1;
            newest_sent = Some(sent_at);
        }
        outcome.rtt = newest_sent.map(|sent_at| sent_at.elapsed());

        tracing::debug!(
            %recipient,
            last_processed,
            advanced_by = last_processed - previous.map_or(0, |p| p + 1) + 1,
            "ack advanced watermark"
        );
        outcome
    }

    /// Messages above the watermark, in increasing sequence order.
    pub fn unacknowledged(&self, recipient: PeerId) -> Vec<SequencedMessage> {
        lock(&self.recipients)
            .get(&recipient)
            .map(|log| log.unacknowledged().cloned().collect())
            .unwrap_or_default()
    }

    /// Lowest sequence still held for retransmission. Everything from the
    /// watermark up to this point was evicted unacknowledged.
    pub fn first_retained(&self, recipient: PeerId) -> Option<u64> {
        lock(&self.recipients).get(&recipient).map(|log| {
            log.history
                .front()
                .map_or(log.next_sequence, |m| m.sequence)
        })
    }

    /// Whether any retained message is still unacknowledged.
    pub fn has_unacknowledged(&self, recipient: PeerId) -> bool {
        lock(&self.recipients)
            .get(&recipient)
            .is_some_and(|log| log.unacknowledged().next().is_some())
    }

    /// Sequence number the next message to `recipient` will receive.
    pub fn next_sequence(&self, recipient: PeerId) -> u64 {
        lock(&self.recipients)
            .get(&recipient)
            .map_or(0, |log| log.next_sequence)
    }

    /// Highest acknowledged sequence for `recipient`.
    pub fn acknowledged(&self, recipient: PeerId) -> Option<u64> {
        lock(&self.recipients)
            .get(&recipient)
            .and_then(|log| log.acknowledged)
    }

    /// Count `count` retransmitted messages.
    pub fn mark_resent(&self, recipient: PeerId, count: usize) {
        if let Some(log) = lock(&self.recipients).get_mut(&recipient) {
            log.resent += count as u64;
        }
    }

    /// Drop all state kept for `recipient`.
    pub fn forget(&self, recipient: PeerId) {
        if lock(&self.recipients).remove(&recipient).is_some() {
            tracing::debug!(%recipient, "sequencer state cleared");
        }
    }

    /// Counters for one recipient stream.
    pub fn stats(&self, recipient: PeerId) -> Option<SequencerStats> {
        lock(&self.recipients).get(&recipient).map(|log| SequencerStats {
            next_sequence: log.next_sequence,
            acknowledged: log.acknowledged,
            unacknowledged: log.unacknowledged().count(),
            sent: log.sent,
            acks_received: log.acks_received,
            resent: log.resent,
        })
    }

    /// Human-readable summary of every recipient stream.
    pub fn report(&self) -> String {
        let recipients = lock(&self.recipients);
        let mut ids: Vec<_> = recipients.keys().copied().collect();
        ids.sort();

        let mut out = String::from("Sequencer:\n");
        for id in ids {
            let log = &recipients[&id];
            let _ = writeln!(
                out,
                "  {id}: next={}, acked={}, unacked={}, sent={}, resent={}",
                log.next_sequence,
                log.acknowledged
                    .map_or_else(|| "-".to_string(), |a| a.to_string()),
                log.unacknowledged().count(),
                log.sent,
                log.resent,
            );
        }
        out
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(crate::messages::HOST_ID, DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: PeerId = PeerId(1);
    const Q: PeerId = PeerId(2);

    /// Sequence and write one message, as the peer send path does.
    fn written(sequencer: &Sequencer, recipient: PeerId, requires_ack: bool) -> u64 {
        let sequence = sequencer.sequence(vec![], recipient, requires_ack).sequence;
        if requires_ack {
            sequencer.mark_written(recipient, sequence);
        }
        sequence
    }

    #[test]
    fn test_sequences_start_at_zero_and_increase_by_one() {
        let sequencer = Sequencer::default();
        let sequences: Vec<u64> = (0..50)
            .map(|i| sequencer.sequence(vec![i as u8], P, true).sequence)
            .collect();
        assert_eq!(sequences, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_recipients_have_independent_counters() {
        let sequencer = Sequencer::default();
        sequencer.sequence(vec![], P, false);
        sequencer.sequence(vec![], P, false);
        let first_q = sequencer.sequence(vec![], Q, false);

        assert_eq!(first_q.sequence, 0);
        assert_eq!(sequencer.next_sequence(P), 2);
        assert_eq!(sequencer.next_sequence(Q), 1);
    }

    #[test]
    fn test_global_ids_are_unique_across_recipients() {
        let sequencer = Sequencer::default();
        let a = sequencer.sequence(vec![], P, false);
        let b = sequencer.sequence(vec![], Q, false);
        assert_ne!(a.global_id, b.global_id);
    }

    #[test]
    fn test_sender_id_follows_local_id() {
        let sequencer = Sequencer::new(PeerId(5), 10);
        assert_eq!(sequencer.sequence(vec![], P, false).sender_id, PeerId(5));
        sequencer.set_local_id(PeerId(9));
        assert_eq!(sequencer.sequence(vec![], P, false).sender_id, PeerId(9));
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let sequencer = Sequencer::new(PeerId(0), 3);
        for _ in 0..5 {
            sequencer.sequence(vec![], P, false);
        }
        let retained: Vec<u64> = sequencer
            .unacknowledged(P)
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(retained, vec![2, 3, 4]);
        assert_eq!(sequencer.first_retained(P), Some(2));
        assert_eq!(sequencer.first_retained(Q), None);
    }

    #[test]
    fn test_ack_purges_history_up_to_watermark() {
        let sequencer = Sequencer::default();
        for _ in 0..4 {
            written(&sequencer, P, true);
        }
        let outcome = sequencer.on_ack(P, 1);

        assert_eq!(outcome.newly_acked, 2);
        assert!(outcome.rtt.is_some());
        assert_eq!(sequencer.acknowledged(P), Some(1));
        let left: Vec<u64> = sequencer
            .unacknowledged(P)
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[test]
    fn test_only_ack_requiring_messages_count() {
        let sequencer = Sequencer::default();
        written(&sequencer, P, false);
        written(&sequencer, P, true);
        written(&sequencer, P, false);

        let outcome = sequencer.on_ack(P, 2);
        assert_eq!(outcome.newly_acked, 1);
    }

    #[test]
    fn test_rtt_measured_from_write_not_sequencing() {
        let sequencer = Sequencer::default();
        let sequence = sequencer.sequence(vec![], P, true).sequence;
        std::thread::sleep(Duration::from_millis(120));
        sequencer.mark_written(P, sequence);

        let outcome = sequencer.on_ack(P, sequence);
        assert_eq!(outcome.newly_acked, 1);
        assert!(outcome.rtt.unwrap() < Duration::from_millis(100));
    }

    #[test]
    fn test_unwritten_message_yields_no_rtt() {
        let sequencer = Sequencer::default();
        sequencer.sequence(vec![], P, true);
        let outcome = sequencer.on_ack(P, 0);
        assert_eq!(outcome.newly_acked, 0);
        assert_eq!(outcome.rtt, None);
        assert_eq!(sequencer.acknowledged(P), Some(0));
    }

    #[test]
    fn test_rewrite_keeps_first_stamp() {
        let sequencer = Sequencer::default();
        let first = written(&sequencer, P, true);
        written(&sequencer, P, true);
        sequencer.mark_written(P, first);

        assert_eq!(sequencer.on_ack(P, 1).newly_acked, 2);
    }

    #[test]
    fn test_stale_ack_is_noop() {
        let sequencer = Sequencer::default();
        for _ in 0..3 {
            written(&sequencer, P, true);
        }
        sequencer.on_ack(P, 2);
        let outcome = sequencer.on_ack(P, 1);
        assert_eq!(outcome, AckOutcome::default());
        assert_eq!(sequencer.acknowledged(P), Some(2));
    }

    #[test]
    fn test_ack_beyond_issued_is_ignored() {
        let sequencer = Sequencer::default();
        sequencer.sequence(vec![], P, true);
        assert_eq!(sequencer.on_ack(P, 7), AckOutcome::default());
        assert_eq!(sequencer.acknowledged(P), None);
        assert!(sequencer.has_unacknowledged(P));
    }

    #[test]
    fn test_forget_restarts_numbering() {
        let sequencer = Sequencer::default();
        sequencer.sequence(vec![], P, true);
        sequencer.forget(P);
        assert!(sequencer.stats(P).is_none());
        assert!(!sequencer.has_unacknowledged(P));
        assert_eq!(sequencer.sequence(vec![], P, true).sequence, 0);
    }

    #[test]
    fn test_stats_and_report() {
        let sequencer = Sequencer::default();
        sequencer.sequence(vec![], P, true);
        sequencer.sequence(vec![], P, true);
        sequencer.on_ack(P, 0);
        sequencer.mark_resent(P, 1);

        let stats = sequencer.stats(P).unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.acks_received, 1);
        assert_eq!(stats.unacknowledged, 1);
        assert_eq!(stats.resent, 1);
        assert!(sequencer.report().contains("peer#1: next=2, acked=0"));
    }
}
