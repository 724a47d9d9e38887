//! Per-peer connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting -> Failed
//!                     |             |              |
//!                     +------> Disconnected <------+
//! ```
//!
//! Every mutation of a peer (send, inbound ack, transport swap, deadline
//! expiry) happens under that peer's own lock, so a swap is never observed
//! half-done. Locks of the shared components are always taken inside the
//! peer lock, never around it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_config::ReliabilityConfig;
use tokio::sync::watch;

use crate::flow::FlowController;
use crate::messages::{
    AckMessage, Envelope, Logout, LostRange, PeerId, Reply, Request, SequencedMessage,
    WireError, encode_envelope,
};
use crate::metrics::MetricsCollector;
use crate::reorder::{Accepted, ReorderBuffer};
use crate::reply_pool::{ReplyError, ReplyPool};
use crate::sequencer::{AckOutcome, Sequencer};
use crate::sync::lock;
use crate::transport::{Transport, TransportError};

// ---------------------------------------------------------------------------
// Shared components
// ---------------------------------------------------------------------------

/// Components shared by every peer of one hub. Each keeps per-peer state
/// internally.
pub struct Reliability {
    /// Outbound sequencing and ack tracking.
    pub sequencer: Sequencer,
    /// Inbound reordering.
    pub reorder: ReorderBuffer,
    /// Admission windows.
    pub flow: FlowController,
    /// Passive metrics.
    pub metrics: MetricsCollector,
}

impl Reliability {
    /// Build the components for a hub whose own id is `local_id`.
    pub fn new(local_id: PeerId, config: &ReliabilityConfig) -> Self {
        Self {
            sequencer: Sequencer::new(local_id, config.history_capacity),
            reorder: ReorderBuffer::with_window(config.reorder_window),
            flow: FlowController::new(config.initial_window as usize),
            metrics: MetricsCollector::new(),
        }
    }

    /// Drop the ordering and window state kept for `peer`.
    pub fn forget(&self, peer: PeerId) {
        self.sequencer.forget(peer);
        self.reorder.forget(peer);
        self.flow.forget(peer);
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No transport and no session.
    Disconnected,
    /// Transport attached, handshake pending.
    Connecting,
    /// Handshake done; messages flow.
    Connected,
    /// Transport lost; waiting for the peer to come back before the deadline.
    Reconnecting,
    /// Reconnection deadline passed.
    Failed,
}

impl PeerState {
    /// Whether the machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
        )
    }

    /// Disconnected or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of [`PeerConnection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the transport with this sequence number.
    Sent(u64),
    /// Held until the handshake completes, the window opens or the
    /// transport is replaced.
    Deferred,
}

/// Errors surfaced by peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// No peer with this id is registered.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer cannot carry the operation in its current state.
    #[error("{peer} is not connected (state {state})")]
    NotConnected {
        /// Peer addressed.
        peer: PeerId,
        /// State it was in.
        state: PeerState,
    },

    /// A state transition the machine does not allow was requested.
    #[error("invalid transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        /// Peer addressed.
        peer: PeerId,
        /// Current state.
        from: PeerState,
        /// Requested state.
        to: PeerState,
    },

    /// Too many outbound messages are already held for the peer.
    #[error("backlog for {peer} is full ({limit} messages)")]
    BacklogFull {
        /// Peer addressed.
        peer: PeerId,
        /// Configured limit.
        limit: usize,
    },

    /// The host refused a new peer.
    #[error("peer limit of {0} reached")]
    PeerLimit(usize),

    /// Waiting for a reply failed.
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// Envelope encoding failed.
    #[error("encoding failed: {0}")]
    Wire(#[from] WireError),
}

// ---------------------------------------------------------------------------
// PeerConnection
// ---------------------------------------------------------------------------

struct PeerInner {
    state: PeerState,
    transport: Option<Arc<dyn Transport>>,
    /// Unsequenced sends made before the handshake completed.
    outbox: VecDeque<(Vec<u8>, bool)>,
    /// Sequenced messages not yet written, in sequence order.
    backlog: VecDeque<SequencedMessage>,
    reconnect_deadline: Option<Instant>,
    name: Option<String>,
    slot: Option<usize>,
    connected_at: Option<Instant>,
}

/// One remote peer and everything needed to talk to it.
pub struct PeerConnection {
    id: PeerId,
    shared: Arc<Reliability>,
    inner: Mutex<PeerInner>,
    /// Serialises drain-and-deliver so payloads reach the consumer in order.
    delivery: Mutex<()>,
    replies: ReplyPool<Vec<u8>>,
    next_correlation: AtomicU64,
    state_tx: watch::Sender<PeerState>,
    reconnect_grace: Duration,
    max_backlog: usize,
}

impl PeerConnection {
    /// Create a disconnected peer.
    pub fn new(id: PeerId, shared: Arc<Reliability>, config: &ReliabilityConfig) -> Self {
        let (state_tx, _) = watch::channel(PeerState::Disconnected);
        Self {
            id,
            shared,
            inner: Mutex::new(PeerInner {
                state: PeerState::Disconnected,
                transport: None,
                outbox: VecDeque::new(),
                backlog: VecDeque::new(),
                reconnect_deadline: None,
                name: None,
                slot: None,
                connected_at: None,
            }),
            delivery: Mutex::new(()),
            replies: ReplyPool::with_base_timeout(config.reply_timeout()),
            next_correlation: AtomicU64::new(1),
            state_tx,
            reconnect_grace: config.reconnect_grace(),
            max_backlog: config.max_backlog.max(1),
        }
    }

    /// Id of the remote peer.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        lock(&self.inner).state
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state_tx.subscribe()
    }

    /// Name given in the handshake.
    pub fn name(&self) -> Option<String> {
        lock(&self.inner).name.clone()
    }

    /// Slot assigned at handshake.
    pub fn slot(&self) -> Option<usize> {
        lock(&self.inner).slot
    }

    /// Time since the handshake completed.
    pub fn connected_for(&self) -> Option<Duration> {
        lock(&self.inner).connected_at.map(|t| t.elapsed())
    }

    /// Current transport.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.inner).transport.clone()
    }

    /// When a reconnecting peer will be failed.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        lock(&self.inner).reconnect_deadline
    }

    /// Sequenced messages waiting for the window or a transport.
    pub fn backlog_len(&self) -> usize {
        lock(&self.inner).backlog.len()
    }

    /// Pending replies for requests sent to this peer.
    pub fn replies(&self) -> &ReplyPool<Vec<u8>> {
        &self.replies
    }

    fn not_connected(&self, state: PeerState) -> PeerError {
        PeerError::NotConnected {
            peer: self.id,
            state,
        }
    }

    fn backlog_full(&self) -> PeerError {
        tracing::warn!(
            peer = %self.id,
            limit = self.max_backlog,
            "outbound backlog full, send refused"
        );
        PeerError::BacklogFull {
            peer: self.id,
            limit: self.max_backlog,
        }
    }

    fn violation(&self, from: PeerState, to: PeerState) -> PeerError {
        tracing::error!(peer = %self.id, %from, %to, "invalid state transition refused");
        debug_assert!(false, "invalid transition {from} -> {to} for {}", self.id);
        PeerError::InvalidTransition {
            peer: self.id,
            from,
            to,
        }
    }

    fn transition(&self, inner: &mut PeerInner, to: PeerState) -> Result<(), PeerError> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(self.violation(from, to));
        }
        inner.state = to;
        tracing::info!(peer = %self.id, %from, %to, "peer state changed");

        if to.is_terminal() {
            self.release(inner);
        }
        self.state_tx.send_replace(to);
        Ok(())
    }

    fn release(&self, inner: &mut PeerInner) {
        if let Some(transport) = inner.transport.take() {
            transport.close();
        }
        inner.outbox.clear();
        inner.backlog.clear();
        inner.reconnect_deadline = None;
        inner.connected_at = None;
        self.replies.cancel_all();
        self.shared.forget(self.id);
    }

    // -- Transport plumbing -------------------------------------------------

    fn write(&self, transport: &Arc<dyn Transport>, bytes: Vec<u8>) {
        if !transport.is_writable() {
            tracing::warn!(peer = %self.id, "transport saturated, writing anyway");
        }
        let counters = self.shared.metrics.counters(self.id);
        let peer = self.id;
        transport.write(
            bytes,
            Box::new(move |result: Result<(), TransportError>| {
                if let Err(e) = result {
                    tracing::warn!(%peer, "write failed: {e}");
                    counters.record_write_failure();
                }
            }),
        );
    }

    fn transmit(&self, inner: &PeerInner, message: &SequencedMessage) -> Result<(), PeerError> {
        let transport = inner
            .transport
            .as_ref()
            .ok_or_else(|| self.not_connected(inner.state))?;
        let bytes = encode_envelope(&Envelope::Sequenced(message.clone()))?;
        if message.requires_ack {
            self.shared.flow.on_sent(self.id);
            self.shared.sequencer.mark_written(self.id, message.sequence);
        }
        self.shared
            .metrics
            .counters(self.id)
            .record_send(bytes.len() as u64);
        self.write(transport, bytes);
        Ok(())
    }

    fn dispatch(
        &self,
        inner: &mut PeerInner,
        payload: Vec<u8>,
        requires_ack: bool,
    ) -> Result<SendStatus, PeerError> {
        let blocked = inner.state != PeerState::Connected
            || !inner.backlog.is_empty()
            || (requires_ack && !self.shared.flow.can_send(self.id));
        if blocked && inner.backlog.len() >= self.max_backlog {
            return Err(self.backlog_full());
        }
        let message = self.shared.sequencer.sequence(payload, self.id, requires_ack);
        if blocked {
            inner.backlog.push_back(message);
            return Ok(SendStatus::Deferred);
        }
        self.transmit(inner, &message)?;
        Ok(SendStatus::Sent(message.sequence))
    }

    fn flush_backlog(&self, inner: &mut PeerInner) -> usize {
        let mut flushed = 0;
        while inner.state == PeerState::Connected {
            let Some(front) = inner.backlog.front() else {
                break;
            };
            if front.requires_ack && !self.shared.flow.can_send(self.id) {
                break;
            }
            let Some(message) = inner.backlog.pop_front() else {
                break;
            };
            if let Err(e) = self.transmit(inner, &message) {
                tracing::warn!(peer = %self.id, "backlog flush stopped: {e}");
                inner.backlog.push_front(message);
                break;
            }
            flushed += 1;
        }
        flushed
    }

    /// Unacknowledged messages that already went out, starting at `from`.
    fn written_unacknowledged(&self, inner: &PeerInner, from: u64) -> Vec<SequencedMessage> {
        let first_unsent = inner.backlog.front().map_or(u64::MAX, |m| m.sequence);
        self.shared
            .sequencer
            .unacknowledged(self.id)
            .into_iter()
            .filter(|m| m.sequence >= from && m.sequence < first_unsent)
            .collect()
    }

    fn retransmit(&self, inner: &PeerInner, messages: &[SequencedMessage]) -> Result<(), PeerError> {
        let Some(transport) = inner.transport.as_ref() else {
            return Err(self.not_connected(inner.state));
        };
        for message in messages {
            let bytes = encode_envelope(&Envelope::Sequenced(message.clone()))?;
            self.write(transport, bytes);
        }
        if !messages.is_empty() {
            self.shared.sequencer.mark_resent(self.id, messages.len());
            self.shared
                .metrics
                .record_resent(self.id, messages.len() as u64);
        }
        Ok(())
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Bind a freshly accepted transport: `Disconnected -> Connecting`.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), PeerError> {
        let mut inner = lock(&self.inner);
        self.transition(&mut inner, PeerState::Connecting)?;
        inner.transport = Some(transport);
        Ok(())
    }

    /// Complete the handshake: `Connecting -> Connected`. Sends held while
    /// connecting are sequenced and written now.
    pub fn on_handshake(&self, name: Option<String>, slot: Option<usize>) -> Result<(), PeerError> {
        let mut inner = lock(&self.inner);
        self.transition(&mut inner, PeerState::Connected)?;
        inner.name = name;
        inner.slot = slot;
        inner.connected_at = Some(Instant::now());

        let held: Vec<_> = inner.outbox.drain(..).collect();
        for (payload, requires_ack) in held {
            self.dispatch(&mut inner, payload, requires_ack)?;
        }
        Ok(())
    }

    /// Take the transport of a peer still in its handshake without closing
    /// it, and disconnect the peer. Used when the handshake turns out to
    /// resume another peer's session.
    pub fn hand_over(&self) -> Option<Arc<dyn Transport>> {
        let mut inner = lock(&self.inner);
        if inner.state != PeerState::Connecting {
            return None;
        }
        let transport = inner.transport.take();
        let _ = self.transition(&mut inner, PeerState::Disconnected);
        transport
    }

    /// React to `transport` going away. Stale transports are ignored.
    pub fn on_transport_lost(&self, transport: &Arc<dyn Transport>) -> PeerState {
        let mut inner = lock(&self.inner);
        let current = inner
            .transport
            .as_ref()
            .is_some_and(|t| std::ptr::addr_eq(Arc::as_ptr(t), Arc::as_ptr(transport)));
        if !current {
            tracing::debug!(peer = %self.id, "loss of a replaced transport ignored");
            return inner.state;
        }

        let to = match inner.state {
            PeerState::Connected if inner.slot.is_some() => PeerState::Reconnecting,
            PeerState::Connected | PeerState::Connecting => PeerState::Disconnected,
            state => return state,
        };
        if let Some(transport) = inner.transport.take() {
            transport.close();
        }
        if to == PeerState::Reconnecting {
            inner.reconnect_deadline = Some(Instant::now() + self.reconnect_grace);
        }
        // Both targets are legal from the matched states.
        let _ = self.transition(&mut inner, to);
        inner.state
    }

    /// Re-associate the peer with a new transport: `Reconnecting -> Connected`.
    ///
    /// Pending replies are cancelled, unacknowledged messages are written
    /// again and the backlog is flushed, all before the lock is released.
    /// Returns the number of retransmitted messages.
    pub fn swap_transport(&self, transport: Arc<dyn Transport>) -> Result<usize, PeerError> {
        let mut inner = lock(&self.inner);
        if inner.state != PeerState::Reconnecting {
            return Err(self.violation(inner.state, PeerState::Connected));
        }

        let cancelled = self.replies.cancel_all();
        inner.transport = Some(transport);
        inner.reconnect_deadline = None;
        self.transition(&mut inner, PeerState::Connected)?;

        let unacked = self.written_unacknowledged(&inner, 0);
        self.retransmit(&inner, &unacked)?;
        let flushed = self.flush_backlog(&mut inner);
        tracing::info!(
            peer = %self.id,
            resent = unacked.len(),
            flushed,
            cancelled,
            "transport swapped"
        );
        Ok(unacked.len())
    }

    /// Fail the peer if its reconnection deadline has passed.
    pub fn check_deadline(&self, now: Instant) -> bool {
        let mut inner = lock(&self.inner);
        let expired = inner.state == PeerState::Reconnecting
            && inner.reconnect_deadline.is_some_and(|d| d <= now);
        if expired {
            tracing::warn!(peer = %self.id, "reconnection deadline expired");
            let _ = self.transition(&mut inner, PeerState::Failed);
        }
        expired
    }

    /// Graceful logout: notify the remote, close the transport and move to
    /// `Disconnected`. A no-op for peers already disconnected or failed.
    pub fn logout(&self, reason: &str) -> Result<(), PeerError> {
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            return Ok(());
        }
        if let Some(transport) = inner.transport.as_ref() {
            let bytes = encode_envelope(&Envelope::Logout(Logout {
                reason: reason.to_string(),
            }))?;
            self.write(transport, bytes);
        }
        self.transition(&mut inner, PeerState::Disconnected)
    }

    /// The remote logged out.
    pub fn on_remote_logout(&self) {
        let mut inner = lock(&self.inner);
        if !inner.state.is_terminal() {
            let _ = self.transition(&mut inner, PeerState::Disconnected);
        }
    }

    /// Administrative removal: a reconnecting peer fails, anything else
    /// disconnects.
    pub fn abandon(&self) {
        let mut inner = lock(&self.inner);
        let to = match inner.state {
            PeerState::Reconnecting => PeerState::Failed,
            PeerState::Connecting | PeerState::Connected => PeerState::Disconnected,
            PeerState::Disconnected | PeerState::Failed => return,
        };
        let _ = self.transition(&mut inner, to);
    }

    // -- Outbound -----------------------------------------------------------

    /// Send a rule-engine payload. Never blocks on the window: messages that
    /// cannot go out now are deferred in order.
    pub fn send(&self, payload: Vec<u8>, requires_ack: bool) -> Result<SendStatus, PeerError> {
        let mut inner = lock(&self.inner);
        match inner.state {
            PeerState::Disconnected | PeerState::Failed => Err(self.not_connected(inner.state)),
            PeerState::Connecting => {
                if inner.outbox.len() >= self.max_backlog {
                    return Err(self.backlog_full());
                }
                inner.outbox.push_back((payload, requires_ack));
                Ok(SendStatus::Deferred)
            }
            PeerState::Connected | PeerState::Reconnecting => {
                self.dispatch(&mut inner, payload, requires_ack)
            }
        }
    }

    /// Write an unsequenced envelope on the current transport.
    pub fn send_control(&self, envelope: &Envelope) -> Result<(), PeerError> {
        let inner = lock(&self.inner);
        let Some(transport) = inner.transport.as_ref() else {
            return Err(self.not_connected(inner.state));
        };
        let bytes = encode_envelope(envelope)?;
        self.write(transport, bytes);
        Ok(())
    }

    /// Send a request and return its correlation id. The reply slot is
    /// registered before the request is written.
    pub fn request(&self, payload: Vec<u8>) -> Result<u64, PeerError> {
        let state = self.state();
        if state != PeerState::Connected {
            return Err(self.not_connected(state));
        }
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        self.replies.initialize(correlation_id);
        let sent = self.send_control(&Envelope::Request(Request {
            correlation_id,
            payload,
        }));
        if let Err(e) = sent {
            self.replies.discard(correlation_id);
            return Err(e);
        }
        Ok(correlation_id)
    }

    /// Block the calling worker thread until the reply to `correlation_id`
    /// arrives or the scaled deadline passes.
    pub fn wait_reply(&self, correlation_id: u64) -> Result<Vec<u8>, PeerError> {
        Ok(self.replies.get(correlation_id)?)
    }

    /// [`request`](Self::request) followed by [`wait_reply`](Self::wait_reply).
    pub fn send_and_wait(&self, payload: Vec<u8>) -> Result<Vec<u8>, PeerError> {
        let correlation_id = self.request(payload)?;
        self.wait_reply(correlation_id)
    }

    /// Answer a request received from this peer.
    pub fn reply(&self, correlation_id: u64, payload: Vec<u8>) -> Result<(), PeerError> {
        self.send_control(&Envelope::Reply(Reply {
            correlation_id,
            payload,
        }))
    }

    /// Scale the reply deadline.
    pub fn set_reply_multiplier(&self, multiplier: u32) {
        self.replies.set_timeout_multiplier(multiplier);
    }

    // -- Inbound ------------------------------------------------------------

    /// Apply a cumulative ack from this peer and flush whatever the opened
    /// window now admits.
    pub fn on_ack(&self, ack: &AckMessage) -> AckOutcome {
        let mut inner = lock(&self.inner);
        let outcome = self
            .shared
            .sequencer
            .on_ack(self.id, ack.last_processed_sequence);
        if let Some(rtt) = outcome.rtt {
            for _ in 0..outcome.newly_acked {
                self.shared.flow.on_ack(self.id, rtt);
            }
            self.shared.metrics.record_rtt(self.id, rtt);
        }
        self.flush_backlog(&mut inner);
        outcome
    }

    /// Buffer an inbound sequenced message, hand every newly contiguous
    /// payload to `deliver` and acknowledge what was delivered.
    ///
    /// Returns the number of payloads delivered.
    pub fn on_sequenced(
        &self,
        message: SequencedMessage,
        mut deliver: impl FnMut(Vec<u8>),
    ) -> Result<usize, PeerError> {
        if message.sender_id != self.id {
            tracing::warn!(
                peer = %self.id,
                claimed = %message.sender_id,
                sequence = message.sequence,
                "sequenced message with foreign sender dropped"
            );
            return Ok(0);
        }
        let state = self.state();
        if state.is_terminal() {
            return Err(self.not_connected(state));
        }

        let _delivery = lock(&self.delivery);
        let reorder = &self.shared.reorder;
        match reorder.accept(message) {
            Accepted::Buffered => {}
            Accepted::Duplicate => {
                if let Some(last) = reorder.last_delivered(self.id) {
                    self.send_ack(last)?;
                }
                return Ok(0);
            }
            Accepted::OutOfWindow => return Ok(0),
        }

        let payloads = reorder.drain(self.id);
        let delivered = payloads.len();
        for payload in payloads {
            deliver(payload);
        }
        if delivered > 0
            && let Some(last) = reorder.last_delivered(self.id)
        {
            self.send_ack(last)?;
        }
        Ok(delivered)
    }

    fn send_ack(&self, last_processed: u64) -> Result<(), PeerError> {
        let local = self.shared.sequencer.local_id();
        self.send_control(&Envelope::Ack(AckMessage::new(local, last_processed)))
    }

    /// Complete a pending request.
    pub fn on_reply(&self, reply: Reply) -> bool {
        self.replies.complete(reply.correlation_id, reply.payload)
    }

    /// Retransmit written, unacknowledged messages from `from_sequence` on.
    ///
    /// When the start of the range was already evicted from history the
    /// peer is told with a [`LostRange`] first, so its gap can close.
    /// Returns the number of retransmitted messages.
    pub fn resend_from(&self, from_sequence: u64) -> Result<usize, PeerError> {
        let inner = lock(&self.inner);
        if inner.state != PeerState::Connected {
            return Ok(0);
        }
        if let Some(lost) = self.evicted_range(&inner, from_sequence) {
            tracing::warn!(
                peer = %self.id,
                from = lost.from_sequence,
                through = lost.through_sequence,
                "requested messages are no longer retained"
            );
            let transport = inner
                .transport
                .as_ref()
                .ok_or_else(|| self.not_connected(inner.state))?;
            self.write(transport, encode_envelope(&Envelope::Lost(lost))?);
        }
        let messages = self.written_unacknowledged(&inner, from_sequence);
        self.retransmit(&inner, &messages)?;
        tracing::debug!(peer = %self.id, from_sequence, count = messages.len(), "resent on request");
        Ok(messages.len())
    }

    /// The part of `from_sequence..` that was written, never acknowledged
    /// and has since fallen out of history.
    fn evicted_range(&self, inner: &PeerInner, from_sequence: u64) -> Option<LostRange> {
        let sequencer = &self.shared.sequencer;
        if sequencer.acknowledged(self.id).is_some_and(|a| from_sequence <= a) {
            return None;
        }
        let first_unsent = inner
            .backlog
            .front()
            .map_or_else(|| sequencer.next_sequence(self.id), |m| m.sequence);
        let retained_from = sequencer.first_retained(self.id)?.min(first_unsent);
        (from_sequence < retained_from).then(|| LostRange {
            from_sequence,
            through_sequence: retained_from - 1,
        })
    }

    /// The peer no longer holds `range`: step over the holes, deliver what
    /// was buffered behind them and acknowledge the new position.
    ///
    /// Returns the number of payloads delivered.
    pub fn on_lost(
        &self,
        range: LostRange,
        mut deliver: impl FnMut(Vec<u8>),
    ) -> Result<usize, PeerError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(self.not_connected(state));
        }

        let _delivery = lock(&self.delivery);
        let reorder = &self.shared.reorder;
        let before = reorder.last_delivered(self.id);
        let skipped = reorder.skip_missing(self.id, range.through_sequence);
        if skipped.newly_lost > 0 {
            self.shared.metrics.record_lost(self.id, skipped.newly_lost);
        }
        let after = reorder.last_delivered(self.id);
        if after != before {
            tracing::warn!(
                peer = %self.id,
                from = range.from_sequence,
                through = range.through_sequence,
                lost = skipped.newly_lost,
                "skipped messages the peer no longer holds"
            );
        }

        let delivered = skipped.payloads.len();
        for payload in skipped.payloads {
            deliver(payload);
        }
        if after != before
            && let Some(last) = after
        {
            self.send_ack(last)?;
        }
        Ok(delivered)
    }
}

impl fmt::Display for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        write!(f, "{} [{}]", self.id, inner.state)?;
        if let Some(name) = &inner.name {
            write!(f, " {name}")?;
        }
        if let Some(slot) = inner.slot {
            write!(f, " slot={slot}")?;
        }
        if let Some(at) = inner.connected_at {
            write!(f, " up {}s", at.elapsed().as_secs())?;
        }
        if let Some(snapshot) = self.shared.metrics.health_snapshot(self.id) {
            write!(
                f,
                " sent={} write_failures={}",
                snapshot.messages_sent, snapshot.write_failures
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HOST_ID, decode_envelope};
    use crate::transport::MemoryTransport;

    const P: PeerId = PeerId(1);

    fn config() -> ReliabilityConfig {
        ReliabilityConfig {
            initial_window: 5,
            reply_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn setup_with(config: &ReliabilityConfig) -> (Arc<Reliability>, PeerConnection) {
        let shared = Arc::new(Reliability::new(HOST_ID, config));
        let peer = PeerConnection::new(P, Arc::clone(&shared), config);
        (shared, peer)
    }

    fn connected() -> (Arc<Reliability>, PeerConnection, Arc<MemoryTransport>) {
        let (shared, peer) = setup_with(&config());
        let transport = Arc::new(MemoryTransport::new());
        peer.attach(transport.clone()).unwrap();
        peer.on_handshake(Some("alice".into()), Some(0)).unwrap();
        (shared, peer, transport)
    }

    fn sequences(envelopes: &[Envelope]) -> Vec<u64> {
        envelopes
            .iter()
            .filter_map(|e| match e {
                Envelope::Sequenced(m) => Some(m.sequence),
                _ => None,
            })
            .collect()
    }

    fn incoming(sequence: u64) -> SequencedMessage {
        SequencedMessage {
            global_id: sequence,
            sender_id: P,
            sequence,
            timestamp_ms: 0,
            requires_ack: true,
            payload: vec![sequence as u8],
        }
    }

    #[test]
    fn test_send_rejected_when_disconnected() {
        let (_, peer) = setup_with(&config());
        assert!(matches!(
            peer.send(vec![1], true),
            Err(PeerError::NotConnected {
                state: PeerState::Disconnected,
                ..
            })
        ));
    }

    #[test]
    fn test_sends_held_until_handshake() {
        let (_, peer) = setup_with(&config());
        let transport = Arc::new(MemoryTransport::new());
        peer.attach(transport.clone()).unwrap();

        assert_eq!(peer.send(vec![1], true).unwrap(), SendStatus::Deferred);
        assert_eq!(peer.send(vec![2], false).unwrap(), SendStatus::Deferred);
        assert!(transport.written().is_empty());

        peer.on_handshake(None, Some(0)).unwrap();
        assert_eq!(peer.state(), PeerState::Connected);
        assert_eq!(sequences(&transport.take_envelopes()), vec![0, 1]);
    }

    #[test]
    fn test_window_defers_and_ack_flushes() {
        let (shared, peer, transport) = connected();
        let statuses: Vec<_> = (0..7).map(|i| peer.send(vec![i], true).unwrap()).collect();

        assert_eq!(statuses[4], SendStatus::Sent(4));
        assert_eq!(statuses[5], SendStatus::Deferred);
        assert_eq!(sequences(&transport.take_envelopes()), vec![0, 1, 2, 3, 4]);
        assert_eq!(peer.backlog_len(), 2);

        let outcome = peer.on_ack(&AckMessage::new(P, 1));
        assert_eq!(outcome.newly_acked, 2);
        assert_eq!(sequences(&transport.take_envelopes()), vec![5, 6]);
        assert_eq!(peer.backlog_len(), 0);
        assert_eq!(shared.flow.in_flight(P), 5);
    }

    #[test]
    fn test_rtt_excludes_time_spent_in_backlog() {
        let (shared, peer, transport) = connected();
        for i in 0..6 {
            peer.send(vec![i], true).unwrap();
        }
        assert_eq!(peer.backlog_len(), 1);

        std::thread::sleep(Duration::from_millis(120));
        peer.on_ack(&AckMessage::new(P, 4));
        assert_eq!(sequences(&transport.take_envelopes()), vec![0, 1, 2, 3, 4, 5]);

        let outcome = peer.on_ack(&AckMessage::new(P, 5));
        assert_eq!(outcome.newly_acked, 1);
        assert!(outcome.rtt.unwrap() < Duration::from_millis(50));
        assert_eq!(shared.flow.window_size(P), 50);
    }

    #[test]
    fn test_full_backlog_refuses_without_consuming_sequence() {
        let config = ReliabilityConfig {
            max_backlog: 2,
            ..config()
        };
        let (shared, peer) = setup_with(&config);
        peer.attach(Arc::new(MemoryTransport::new())).unwrap();
        peer.on_handshake(None, Some(0)).unwrap();

        for i in 0..7 {
            peer.send(vec![i], true).unwrap();
        }
        assert!(matches!(
            peer.send(vec![7], true),
            Err(PeerError::BacklogFull { limit: 2, .. })
        ));
        assert_eq!(shared.sequencer.next_sequence(P), 7);

        peer.on_ack(&AckMessage::new(P, 4));
        assert_eq!(peer.backlog_len(), 0);
        assert_eq!(peer.send(vec![7], true).unwrap(), SendStatus::Sent(7));
    }

    #[test]
    fn test_unacked_messages_do_not_consume_window() {
        let (shared, peer, _transport) = connected();
        for _ in 0..10 {
            assert!(matches!(peer.send(vec![], false).unwrap(), SendStatus::Sent(_)));
        }
        assert_eq!(shared.flow.in_flight(P), 0);
    }

    #[test]
    fn test_saturated_transport_still_written() {
        let (_, peer, transport) = connected();
        transport.set_writable(false);
        assert_eq!(peer.send(vec![9], false).unwrap(), SendStatus::Sent(0));
        assert_eq!(transport.written().len(), 1);
    }

    #[test]
    fn test_write_failure_counted_not_returned() {
        let (shared, peer, transport) = connected();
        transport.set_fail_writes(true);
        assert!(peer.send(vec![1], false).is_ok());
        assert_eq!(shared.metrics.health_snapshot(P).unwrap().write_failures, 1);
    }

    #[test]
    fn test_transport_loss_then_swap_resends_in_order() {
        let (_, peer, old) = connected();
        peer.send(vec![0], true).unwrap();
        peer.send(vec![1], true).unwrap();
        peer.on_ack(&AckMessage::new(P, 0));
        old.take_written();

        let lost: Arc<dyn Transport> = old.clone();
        assert_eq!(peer.on_transport_lost(&lost), PeerState::Reconnecting);
        assert!(peer.reconnect_deadline().is_some());
        assert_eq!(peer.send(vec![2], true).unwrap(), SendStatus::Deferred);

        let fresh = Arc::new(MemoryTransport::new());
        assert_eq!(peer.swap_transport(fresh.clone()).unwrap(), 1);
        assert_eq!(peer.state(), PeerState::Connected);
        assert_eq!(sequences(&fresh.take_envelopes()), vec![1, 2]);
        assert!(!old.is_open());
    }

    #[test]
    fn test_swap_cancels_pending_replies() {
        let (_, peer, transport) = connected();
        let id = peer.request(b"q".to_vec()).unwrap();
        let lost: Arc<dyn Transport> = transport.clone();
        peer.on_transport_lost(&lost);
        peer.swap_transport(Arc::new(MemoryTransport::new())).unwrap();

        assert!(matches!(
            peer.wait_reply(id),
            Err(PeerError::Reply(ReplyError::NotPending))
        ));
        assert_eq!(peer.replies().pending_count(), 0);
    }

    #[test]
    fn test_loss_of_replaced_transport_ignored() {
        let (_, peer, _transport) = connected();
        let stranger: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        assert_eq!(peer.on_transport_lost(&stranger), PeerState::Connected);
    }

    #[test]
    fn test_loss_before_handshake_disconnects() {
        let (_, peer) = setup_with(&config());
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        peer.attach(Arc::clone(&transport)).unwrap();
        assert_eq!(peer.on_transport_lost(&transport), PeerState::Disconnected);
    }

    #[test]
    fn test_loss_without_slot_disconnects() {
        let (shared, peer) = setup_with(&config());
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        peer.attach(Arc::clone(&transport)).unwrap();
        peer.on_handshake(Some("spectator".into()), None).unwrap();
        peer.send(vec![1], true).unwrap();

        assert_eq!(peer.on_transport_lost(&transport), PeerState::Disconnected);
        assert_eq!(peer.reconnect_deadline(), None);
        assert!(!transport.is_open());
        assert!(shared.sequencer.stats(P).is_none());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invalid transition"))]
    fn test_swap_while_connected_is_violation() {
        let (_, peer, _transport) = connected();
        let result = peer.swap_transport(Arc::new(MemoryTransport::new()));
        assert!(matches!(result, Err(PeerError::InvalidTransition { .. })));
        assert_eq!(peer.state(), PeerState::Connected);
    }

    #[test]
    fn test_deadline_expiry_fails_and_forgets() {
        let config = ReliabilityConfig {
            reconnect_grace_secs: 0,
            ..config()
        };
        let (shared, peer) = setup_with(&config);
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        peer.attach(Arc::clone(&transport)).unwrap();
        peer.on_handshake(None, Some(0)).unwrap();
        peer.send(vec![], true).unwrap();
        peer.on_transport_lost(&transport);

        assert!(peer.check_deadline(Instant::now()));
        assert_eq!(peer.state(), PeerState::Failed);
        assert!(shared.sequencer.stats(P).is_none());
        assert_eq!(shared.flow.in_flight(P), 0);
        assert!(!peer.check_deadline(Instant::now()));
    }

    #[test]
    fn test_logout_notifies_and_disconnects() {
        let (shared, peer, transport) = connected();
        peer.send(vec![], true).unwrap();
        transport.take_written();
        let mut states = peer.subscribe();

        peer.logout("bye").unwrap();
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), PeerState::Disconnected);
        assert!(matches!(
            transport.take_envelopes().as_slice(),
            [Envelope::Logout(Logout { reason })] if reason == "bye"
        ));
        assert!(shared.sequencer.stats(P).is_none());
        peer.logout("again").unwrap();
    }

    #[test]
    fn test_inbound_reordered_and_acked() {
        let (_, peer, transport) = connected();
        let mut delivered = Vec::new();

        assert_eq!(peer.on_sequenced(incoming(1), |p| delivered.push(p)).unwrap(), 0);
        assert!(transport.written().is_empty());
        assert_eq!(peer.on_sequenced(incoming(0), |p| delivered.push(p)).unwrap(), 2);
        assert_eq!(delivered, vec![vec![0], vec![1]]);

        let envelopes = transport.take_envelopes();
        assert!(matches!(
            envelopes.as_slice(),
            [Envelope::Ack(AckMessage {
                peer_id: HOST_ID,
                last_processed_sequence: 1,
                ..
            })]
        ));
    }

    #[test]
    fn test_duplicate_reacked_not_redelivered() {
        let (_, peer, transport) = connected();
        let mut count = 0;
        peer.on_sequenced(incoming(0), |_| count += 1).unwrap();
        transport.take_written();

        peer.on_sequenced(incoming(0), |_| count += 1).unwrap();
        assert_eq!(count, 1);
        let envelopes = transport.take_envelopes();
        assert!(matches!(envelopes.as_slice(), [Envelope::Ack(_)]));
    }

    #[test]
    fn test_foreign_sender_dropped() {
        let (shared, peer, _transport) = connected();
        let mut message = incoming(0);
        message.sender_id = PeerId(9);
        assert_eq!(peer.on_sequenced(message, |_| panic!("delivered")).unwrap(), 0);
        assert_eq!(shared.reorder.pending_count(PeerId(9)), 0);
    }

    #[test]
    fn test_request_reply_roundtrip() {
        let (_, peer, transport) = connected();
        let id = peer.request(b"ping".to_vec()).unwrap();

        let written = transport.take_written();
        assert!(matches!(
            decode_envelope(&written[0]).unwrap(),
            Envelope::Request(Request { correlation_id, .. }) if correlation_id == id
        ));

        assert!(peer.on_reply(Reply {
            correlation_id: id,
            payload: b"pong".to_vec(),
        }));
        assert_eq!(peer.wait_reply(id).unwrap(), b"pong");
    }

    #[test]
    fn test_resend_from_requested_sequence() {
        let (shared, peer, transport) = connected();
        for i in 0..4 {
            peer.send(vec![i], true).unwrap();
        }
        transport.take_written();

        assert_eq!(peer.resend_from(2).unwrap(), 2);
        assert_eq!(sequences(&transport.take_envelopes()), vec![2, 3]);
        assert_eq!(shared.sequencer.stats(P).unwrap().resent, 2);
        assert_eq!(shared.metrics.health_snapshot(P).unwrap().messages_resent, 2);
    }

    #[test]
    fn test_evicted_history_answered_with_lost_range() {
        let config = ReliabilityConfig {
            history_capacity: 2,
            ..config()
        };
        let (_, peer) = setup_with(&config);
        let transport = Arc::new(MemoryTransport::new());
        peer.attach(transport.clone()).unwrap();
        peer.on_handshake(None, Some(0)).unwrap();
        for i in 0..4 {
            peer.send(vec![i], true).unwrap();
        }
        transport.take_written();

        assert_eq!(peer.resend_from(0).unwrap(), 2);
        let envelopes = transport.take_envelopes();
        assert_eq!(
            envelopes[0],
            Envelope::Lost(LostRange {
                from_sequence: 0,
                through_sequence: 1,
            })
        );
        assert_eq!(sequences(&envelopes), vec![2, 3]);
    }

    #[test]
    fn test_retained_history_needs_no_lost_range() {
        let (_, peer, transport) = connected();
        for i in 0..3 {
            peer.send(vec![i], true).unwrap();
        }
        transport.take_written();

        peer.resend_from(1).unwrap();
        assert!(
            !transport
                .take_envelopes()
                .iter()
                .any(|e| matches!(e, Envelope::Lost(_)))
        );
    }

    #[test]
    fn test_lost_range_closes_gap_and_acks() {
        let (shared, peer, transport) = connected();
        let mut delivered = Vec::new();
        peer.on_sequenced(incoming(2), |p| delivered.push(p)).unwrap();
        peer.on_sequenced(incoming(3), |p| delivered.push(p)).unwrap();
        assert!(delivered.is_empty());

        let range = LostRange {
            from_sequence: 0,
            through_sequence: 1,
        };
        assert_eq!(peer.on_lost(range, |p| delivered.push(p)).unwrap(), 2);
        assert_eq!(delivered, vec![vec![2], vec![3]]);
        assert!(matches!(
            transport.take_envelopes().as_slice(),
            [Envelope::Ack(AckMessage {
                last_processed_sequence: 3,
                ..
            })]
        ));
        assert_eq!(shared.metrics.health_snapshot(P).unwrap().messages_lost, 2);
        assert!(shared.reorder.stalled(Duration::ZERO).is_empty());

        // A repeated answer changes nothing.
        assert_eq!(peer.on_lost(range, |p| delivered.push(p)).unwrap(), 0);
        assert!(transport.written().is_empty());
        assert_eq!(shared.metrics.health_snapshot(P).unwrap().messages_lost, 2);
    }

    #[test]
    fn test_display_summary() {
        let (_, peer, _transport) = connected();
        let text = peer.to_string();
        assert!(text.starts_with("peer#1 [Connected] alice slot=0"));
    }
}
