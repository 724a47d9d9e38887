//! Peer table and frame dispatch.
//!
//! A [`PeerHub`] owns the shared reliability components and one
//! [`PeerConnection`] per remote peer. Transports feed it raw frames through
//! [`PeerHub::handle_frame`]; the rule engine sees ordered payloads and
//! lifecycle changes through an [`EventSink`].
//!
//! A host numbers its peers from 1 and calls itself [`HOST_ID`]. A client
//! keys its single connection as [`HOST_ID`] and learns its own id from the
//! host's [`Welcome`].

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tessera_config::ReliabilityConfig;

use crate::messages::{
    Envelope, HOST_ID, Hello, PeerId, ResendRequest, Welcome, decode_envelope, encode_envelope,
};
use crate::metrics::HealthSnapshot;
use crate::peer::{PeerConnection, PeerError, PeerState, Reliability, SendStatus};
use crate::sync::{lock, read, write};
use crate::tracker::StateTracker;
use crate::transport::{Transport, TransportError};

// ---------------------------------------------------------------------------
// Rule-engine seam
// ---------------------------------------------------------------------------

/// Consumer of ordered payloads and peer lifecycle events.
///
/// Callbacks run on whichever task handled the frame, never under a peer
/// lock, so they may call back into the hub.
pub trait EventSink: Send + Sync {
    /// An in-order payload from `from`.
    fn deliver(&self, from: PeerId, payload: Vec<u8>);

    /// A correlated request. Returning `Some` sends it back as the reply.
    fn on_request(&self, from: PeerId, payload: Vec<u8>) -> Option<Vec<u8>> {
        let _ = (from, payload);
        None
    }

    /// `peer` completed its handshake.
    fn on_peer_connected(&self, peer: PeerId) {
        let _ = peer;
    }

    /// `peer` left for good, ending in `state`.
    fn on_peer_disconnected(&self, peer: PeerId, state: PeerState) {
        let _ = (peer, state);
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn deliver(&self, _from: PeerId, _payload: Vec<u8>) {}
}

// ---------------------------------------------------------------------------
// IdGenerator
// ---------------------------------------------------------------------------

/// Atomic generator for monotonically increasing [`PeerId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unused id.
    pub fn next_id(&self) -> PeerId {
        PeerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// PeerHub
// ---------------------------------------------------------------------------

/// Which side of the session a hub plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts peers and assigns their ids.
    Host,
    /// Connects to one host.
    Client,
}

/// All peers of one session.
pub struct PeerHub {
    role: Role,
    name: String,
    config: ReliabilityConfig,
    max_peers: usize,
    shared: Arc<Reliability>,
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    ids: IdGenerator,
    roster: StateTracker<PeerId, PeerState>,
    sink: Arc<dyn EventSink>,
    /// Client side: transport waiting for the host's answer to a resume.
    pending_resume: Mutex<Option<Arc<dyn Transport>>>,
}

fn write_direct(transport: &Arc<dyn Transport>, envelope: &Envelope) -> Result<(), PeerError> {
    let bytes = encode_envelope(envelope)?;
    transport.write(
        bytes,
        Box::new(|result: Result<(), TransportError>| {
            if let Err(e) = result {
                tracing::warn!("handshake write failed: {e}");
            }
        }),
    );
    Ok(())
}

impl PeerHub {
    /// Hub for a host accepting up to `max_peers` peers.
    pub fn host(config: &ReliabilityConfig, max_peers: usize, sink: Arc<dyn EventSink>) -> Self {
        Self::with_role(Role::Host, "host", config, max_peers, sink)
    }

    /// Hub for a client named `name`.
    pub fn client(config: &ReliabilityConfig, name: &str, sink: Arc<dyn EventSink>) -> Self {
        Self::with_role(Role::Client, name, config, 1, sink)
    }

    fn with_role(
        role: Role,
        name: &str,
        config: &ReliabilityConfig,
        max_peers: usize,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            role,
            name: name.to_string(),
            config: config.clone(),
            max_peers,
            shared: Arc::new(Reliability::new(HOST_ID, config)),
            peers: RwLock::new(HashMap::new()),
            ids: IdGenerator::new(),
            roster: StateTracker::new(),
            sink,
            pending_resume: Mutex::new(None),
        }
    }

    /// Host or client.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Id this hub stamps on its own messages.
    pub fn local_id(&self) -> PeerId {
        self.shared.sequencer.local_id()
    }

    /// Shared components.
    pub fn reliability(&self) -> &Reliability {
        &self.shared
    }

    /// Look up a peer.
    pub fn peer(&self, id: PeerId) -> Option<Arc<PeerConnection>> {
        read(&self.peers).get(&id).cloned()
    }

    fn require(&self, id: PeerId) -> Result<Arc<PeerConnection>, PeerError> {
        self.peer(id).ok_or(PeerError::UnknownPeer(id))
    }

    /// Ids of every registered peer, ordered.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = read(&self.peers).keys().copied().collect();
        ids.sort();
        ids
    }

    /// State of every peer as last published.
    pub fn roster(&self) -> HashMap<PeerId, PeerState> {
        self.roster.snapshot()
    }

    /// Peers in `Connected`.
    pub fn connected_count(&self) -> usize {
        read(&self.peers)
            .values()
            .filter(|p| p.state() == PeerState::Connected)
            .count()
    }

    fn register(&self, peer: Arc<PeerConnection>) {
        let id = peer.id();
        self.roster.set(id, peer.state());
        write(&self.peers).insert(id, peer);
    }

    fn publish(&self, peer: &PeerConnection) {
        self.roster.set(peer.id(), peer.state());
    }

    fn remove(&self, id: PeerId) {
        if write(&self.peers).remove(&id).is_some() {
            self.roster.remove(id);
            self.shared.metrics.forget(id);
            tracing::debug!(peer = %id, "peer removed");
        }
    }

    /// Scale every reply deadline with the number of connected peers.
    fn refresh_reply_timeouts(&self) {
        let multiplier = self.connected_count().max(1) as u32;
        for peer in read(&self.peers).values() {
            peer.set_reply_multiplier(multiplier);
        }
    }

    fn free_slot(&self) -> usize {
        let used: BTreeSet<usize> = read(&self.peers)
            .values()
            .filter(|p| matches!(p.state(), PeerState::Connected | PeerState::Reconnecting))
            .filter_map(|p| p.slot())
            .collect();
        (0..).find(|slot| !used.contains(slot)).unwrap_or(0)
    }

    // -- Connection setup ---------------------------------------------------

    /// Host side: register a freshly accepted transport as a new peer in
    /// `Connecting`.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Result<PeerId, PeerError> {
        let live = read(&self.peers)
            .values()
            .filter(|p| !p.state().is_terminal())
            .count();
        if live >= self.max_peers {
            tracing::warn!("Peer limit reached, rejecting {}", transport.describe());
            transport.close();
            return Err(PeerError::PeerLimit(self.max_peers));
        }

        let id = self.ids.next_id();
        let peer = Arc::new(PeerConnection::new(id, Arc::clone(&self.shared), &self.config));
        tracing::info!("Accepted {} as {id}", transport.describe());
        peer.attach(transport)?;
        self.register(peer);
        Ok(id)
    }

    /// Client side: bind `transport` to the host and send `Hello`.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), PeerError> {
        if let Some(existing) = self.peer(HOST_ID)
            && !existing.state().is_terminal()
        {
            return Err(PeerError::InvalidTransition {
                peer: HOST_ID,
                from: existing.state(),
                to: PeerState::Connecting,
            });
        }
        let peer = Arc::new(PeerConnection::new(
            HOST_ID,
            Arc::clone(&self.shared),
            &self.config,
        ));
        peer.attach(transport)?;
        peer.send_control(&Envelope::Hello(Hello {
            name: self.name.clone(),
            resume: None,
        }))?;
        self.register(peer);
        Ok(())
    }

    /// Client side: offer `transport` to the host as the continuation of
    /// the current session. The swap happens when the host answers.
    pub fn resume(&self, transport: Arc<dyn Transport>) -> Result<(), PeerError> {
        let peer = self.require(HOST_ID)?;
        let state = peer.state();
        if state != PeerState::Reconnecting {
            return Err(PeerError::NotConnected {
                peer: HOST_ID,
                state,
            });
        }
        write_direct(
            &transport,
            &Envelope::Hello(Hello {
                name: self.name.clone(),
                resume: Some(self.local_id()),
            }),
        )?;
        *lock(&self.pending_resume) = Some(transport);
        Ok(())
    }

    /// Report that `transport`, bound to `id`, is gone.
    pub fn transport_lost(&self, id: PeerId, transport: &Arc<dyn Transport>) {
        {
            let mut pending = lock(&self.pending_resume);
            if pending
                .as_ref()
                .is_some_and(|t| std::ptr::addr_eq(Arc::as_ptr(t), Arc::as_ptr(transport)))
            {
                *pending = None;
            }
        }
        let Some(peer) = self.peer(id) else {
            return;
        };
        let before = peer.state();
        let after = peer.on_transport_lost(transport);
        if before == after {
            return;
        }
        self.publish(&peer);
        match after {
            PeerState::Reconnecting => {
                tracing::info!(peer = %id, "transport lost, awaiting reconnection");
            }
            PeerState::Disconnected => {
                self.remove(id);
                if before == PeerState::Connected {
                    self.sink.on_peer_disconnected(id, after);
                }
            }
            _ => {}
        }
        self.refresh_reply_timeouts();
    }

    // -- Inbound ------------------------------------------------------------

    /// Decode and dispatch one frame received from `from`. Returns the peer
    /// the transport is bound to afterwards, which differs from `from` when
    /// the frame resumed an earlier session.
    pub fn handle_frame(&self, from: PeerId, bytes: &[u8]) -> Result<PeerId, PeerError> {
        let envelope = decode_envelope(bytes)?;
        let peer = self.require(from)?;

        match envelope {
            Envelope::Hello(hello) => return self.handle_hello(peer, hello),
            Envelope::Welcome(welcome) => self.handle_welcome(peer, welcome)?,
            Envelope::Logout(logout) => {
                tracing::info!(peer = %from, reason = %logout.reason, "peer logged out");
                let before = peer.state();
                peer.on_remote_logout();
                self.remove(from);
                if matches!(before, PeerState::Connected | PeerState::Reconnecting) {
                    self.sink.on_peer_disconnected(from, PeerState::Disconnected);
                }
                self.refresh_reply_timeouts();
            }
            Envelope::Sequenced(message) => {
                self.shared
                    .metrics
                    .record_receive(from, bytes.len() as u64);
                peer.on_sequenced(message, |payload| self.sink.deliver(from, payload))?;
            }
            Envelope::Ack(ack) => {
                peer.on_ack(&ack);
            }
            Envelope::ResendRequest(request) => {
                peer.resend_from(request.from_sequence)?;
            }
            Envelope::Lost(range) => {
                peer.on_lost(range, |payload| self.sink.deliver(from, payload))?;
            }
            Envelope::Request(request) => {
                if let Some(answer) = self.sink.on_request(from, request.payload) {
                    peer.reply(request.correlation_id, answer)?;
                }
            }
            Envelope::Reply(reply) => {
                peer.on_reply(reply);
            }
        }
        Ok(from)
    }

    fn handle_hello(&self, peer: Arc<PeerConnection>, hello: Hello) -> Result<PeerId, PeerError> {
        let id = peer.id();
        if self.role != Role::Host || peer.state() != PeerState::Connecting {
            tracing::warn!(peer = %id, state = %peer.state(), "unexpected hello ignored");
            return Ok(id);
        }

        if let Some(resumed) = hello.resume
            && let Some(previous) = self.peer(resumed)
            && matches!(
                previous.state(),
                PeerState::Connected | PeerState::Reconnecting
            )
        {
            return self.resume_peer(&peer, &previous);
        }
        if let Some(resumed) = hello.resume {
            tracing::info!(peer = %id, %resumed, "resume of an expired session, starting fresh");
        }

        peer.send_control(&Envelope::Welcome(Welcome {
            peer_id: id,
            host_id: HOST_ID,
        }))?;
        peer.on_handshake(Some(hello.name), Some(self.free_slot()))?;
        self.publish(&peer);
        self.refresh_reply_timeouts();
        tracing::info!("{peer} joined");
        self.sink.on_peer_connected(id);
        Ok(id)
    }

    fn resume_peer(
        &self,
        newcomer: &PeerConnection,
        previous: &PeerConnection,
    ) -> Result<PeerId, PeerError> {
        let Some(transport) = newcomer.hand_over() else {
            return Ok(newcomer.id());
        };
        self.remove(newcomer.id());

        if previous.state() == PeerState::Connected
            && let Some(stale) = previous.transport()
        {
            // The old connection is dead but its reader has not noticed yet.
            previous.on_transport_lost(&stale);
        }

        write_direct(
            &transport,
            &Envelope::Welcome(Welcome {
                peer_id: previous.id(),
                host_id: HOST_ID,
            }),
        )?;
        previous.swap_transport(transport)?;
        self.publish(previous);
        self.refresh_reply_timeouts();
        tracing::info!("{previous} resumed");
        Ok(previous.id())
    }

    fn handle_welcome(&self, peer: Arc<PeerConnection>, welcome: Welcome) -> Result<(), PeerError> {
        if self.role != Role::Client {
            tracing::warn!(peer = %peer.id(), "welcome sent to a host ignored");
            return Ok(());
        }
        match peer.state() {
            PeerState::Connecting => {
                self.shared.sequencer.set_local_id(welcome.peer_id);
                peer.on_handshake(Some("host".to_string()), Some(0))?;
                self.publish(&peer);
                self.refresh_reply_timeouts();
                tracing::info!("Joined host as {}", welcome.peer_id);
                self.sink.on_peer_connected(HOST_ID);
            }
            PeerState::Reconnecting => {
                let Some(transport) = lock(&self.pending_resume).take() else {
                    tracing::warn!("welcome without a pending resume ignored");
                    return Ok(());
                };
                if welcome.peer_id == self.local_id() {
                    peer.swap_transport(transport)?;
                    self.publish(&peer);
                    tracing::info!("Session resumed as {}", welcome.peer_id);
                } else {
                    tracing::warn!(
                        previous = %self.local_id(),
                        assigned = %welcome.peer_id,
                        "host started a new session"
                    );
                    peer.abandon();
                    self.remove(HOST_ID);
                    self.sink.on_peer_disconnected(HOST_ID, PeerState::Failed);

                    let fresh = Arc::new(PeerConnection::new(
                        HOST_ID,
                        Arc::clone(&self.shared),
                        &self.config,
                    ));
                    fresh.attach(transport)?;
                    self.shared.sequencer.set_local_id(welcome.peer_id);
                    fresh.on_handshake(Some("host".to_string()), Some(0))?;
                    self.register(fresh);
                    self.sink.on_peer_connected(HOST_ID);
                }
                self.refresh_reply_timeouts();
            }
            state => {
                tracing::warn!(%state, "unexpected welcome ignored");
            }
        }
        Ok(())
    }

    // -- Outbound -----------------------------------------------------------

    /// Send a payload to one peer.
    pub fn send_to_peer(
        &self,
        id: PeerId,
        payload: Vec<u8>,
        requires_ack: bool,
    ) -> Result<SendStatus, PeerError> {
        self.require(id)?.send(payload, requires_ack)
    }

    /// Send a payload to every live peer. Failures are reported per peer and
    /// never stop the fan-out.
    pub fn broadcast(
        &self,
        payload: &[u8],
        requires_ack: bool,
    ) -> Vec<(PeerId, Result<SendStatus, PeerError>)> {
        let targets = {
            let frozen = self.roster.frozen();
            let mut ids: Vec<_> = frozen
                .snapshot()
                .into_iter()
                .filter(|(_, s)| matches!(s, PeerState::Connected | PeerState::Reconnecting))
                .map(|(id, _)| id)
                .collect();
            ids.sort();
            ids
        };
        targets
            .into_iter()
            .map(|id| (id, self.send_to_peer(id, payload.to_vec(), requires_ack)))
            .collect()
    }

    /// Send a request and block the calling worker thread for the reply.
    ///
    /// Never call this from the I/O reactor.
    pub fn send_and_wait(&self, id: PeerId, payload: Vec<u8>) -> Result<Vec<u8>, PeerError> {
        self.require(id)?.send_and_wait(payload)
    }

    /// Answer a request received from `id`.
    pub fn reply(&self, id: PeerId, correlation_id: u64, payload: Vec<u8>) -> Result<(), PeerError> {
        self.require(id)?.reply(correlation_id, payload)
    }

    /// Gracefully log `id` out and forget it.
    pub fn logout(&self, id: PeerId, reason: &str) -> Result<(), PeerError> {
        let peer = self.require(id)?;
        let before = peer.state();
        peer.logout(reason)?;
        self.remove(id);
        if matches!(before, PeerState::Connected | PeerState::Reconnecting) {
            self.sink.on_peer_disconnected(id, PeerState::Disconnected);
        }
        self.refresh_reply_timeouts();
        Ok(())
    }

    /// Log every peer out.
    pub fn shutdown(&self, reason: &str) {
        for id in self.peer_ids() {
            if let Err(e) = self.logout(id, reason) {
                tracing::warn!(peer = %id, "logout failed: {e}");
            }
        }
    }

    // -- Housekeeping -------------------------------------------------------

    /// Fail peers whose reconnection deadline passed and ask for
    /// retransmission of gaps older than the gap timeout.
    pub fn tick(&self, now: Instant) {
        let peers: Vec<_> = read(&self.peers).values().cloned().collect();
        let mut changed = false;
        for peer in peers {
            if peer.check_deadline(now) {
                let id = peer.id();
                self.remove(id);
                self.sink.on_peer_disconnected(id, PeerState::Failed);
                changed = true;
            }
        }
        if changed {
            self.refresh_reply_timeouts();
        }

        let reorder = &self.shared.reorder;
        for (sender, from_sequence) in reorder.stalled(self.config.gap_timeout()) {
            let Some(peer) = self.peer(sender) else {
                continue;
            };
            if peer.state() != PeerState::Connected {
                continue;
            }
            let newly_missing = reorder.claim_missing(sender);
            if newly_missing > 0 {
                self.shared.metrics.record_lost(sender, newly_missing);
            }
            tracing::debug!(
                peer = %sender,
                from_sequence,
                missing = reorder.gap_len(sender),
                "requesting resend"
            );
            if let Err(e) = peer.send_control(&Envelope::ResendRequest(ResendRequest {
                from_sequence,
            })) {
                tracing::warn!(peer = %sender, "resend request failed: {e}");
            }
            reorder.touch_gap(sender);
        }
    }

    /// Metrics for one peer.
    pub fn health_snapshot(&self, id: PeerId) -> Option<HealthSnapshot> {
        self.shared.metrics.health_snapshot(id)
    }

    /// Human-readable report of every peer and component.
    pub fn report(&self) -> String {
        let mut out = String::from("Peers:\n");
        for id in self.peer_ids() {
            if let Some(peer) = self.peer(id) {
                let _ = writeln!(out, "  {peer}");
            }
        }
        out.push_str(&self.shared.sequencer.report());
        out.push_str(&self.shared.reorder.report());
        out.push_str(&self.shared.flow.report());
        out.push_str(&self.shared.metrics.report());
        out
    }
}
