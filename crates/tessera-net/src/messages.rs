//! Wire-level records and envelope serialization.
//!
//! Every frame carries one [`Envelope`] encoded with [`postcard`] and prefixed
//! with a protocol version byte. Use [`encode_envelope`] and
//! [`decode_envelope`] for encoding/decoding.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every serialized envelope.
pub const PROTOCOL_VERSION: u8 = 2;

/// Identifier of a peer within one hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

/// The id every host uses for itself. Remote peers are numbered from 1.
pub const HOST_ID: PeerId = PeerId(0);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Milliseconds since the Unix epoch, used for wire timestamps.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Ordering records
// ---------------------------------------------------------------------------

/// An opaque event stamped with its position in the sender's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequencedMessage {
    /// Unique id across every stream produced by the sending hub.
    pub global_id: u64,
    /// Peer that produced the message.
    pub sender_id: PeerId,
    /// Position in the sender's stream to this recipient, starting at 0.
    pub sequence: u64,
    /// Send time in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Whether the sender counts this message against its admission window.
    pub requires_ack: bool,
    /// Rule-engine payload, never inspected by this layer.
    pub payload: Vec<u8>,
}

/// Cumulative acknowledgment: every sequence up to and including
/// `last_processed_sequence` has been delivered to the consumer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckMessage {
    /// Peer sending the acknowledgment.
    pub peer_id: PeerId,
    /// Highest contiguous sequence delivered.
    pub last_processed_sequence: u64,
    /// Send time in epoch milliseconds.
    pub sent_at_ms: i64,
}

impl AckMessage {
    /// Build an ack stamped with the current time.
    pub fn new(peer_id: PeerId, last_processed_sequence: u64) -> Self {
        Self {
            peer_id,
            last_processed_sequence,
            sent_at_ms: now_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Top-level frame content. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Envelope {
    // --- Session ---
    /// Identifying handshake sent by a connecting peer.
    Hello(Hello),
    /// Host's answer to [`Hello`], carrying the id assigned to the peer.
    Welcome(Welcome),
    /// Graceful session end.
    Logout(Logout),

    // --- Ordered stream ---
    /// A sequenced rule-engine event.
    Sequenced(SequencedMessage),
    /// Cumulative acknowledgment of a sequenced stream.
    Ack(AckMessage),
    /// Receiver asks for retransmission starting at a missing sequence.
    ResendRequest(ResendRequest),
    /// Sender no longer holds part of a requested range.
    Lost(LostRange),

    // --- Correlated exchange ---
    /// A request expecting a [`Reply`] with the same correlation id.
    Request(Request),
    /// Answer to a [`Request`].
    Reply(Reply),
}

/// Handshake from a connecting peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    /// Display name of the peer.
    pub name: String,
    /// Previously assigned id when resuming after a transport loss.
    pub resume: Option<PeerId>,
}

/// Handshake answer from the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    /// Id the host assigned to the receiving peer.
    pub peer_id: PeerId,
    /// Id the host uses for itself.
    pub host_id: PeerId,
}

/// Graceful logout notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Logout {
    /// Human-readable reason.
    pub reason: String,
}

/// Request to retransmit everything from `from_sequence` onward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResendRequest {
    /// First sequence the receiver is missing.
    pub from_sequence: u64,
}

/// Answer to a [`ResendRequest`] whose start was evicted from the sender's
/// history. The receiver steps over the holes and counts them as lost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LostRange {
    /// First sequence requested.
    pub from_sequence: u64,
    /// Last sequence that can no longer be retransmitted.
    pub through_sequence: u64,
}

/// Correlated request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Correlation id echoed by the reply.
    pub correlation_id: u64,
    /// Rule-engine payload.
    pub payload: Vec<u8>,
}

/// Correlated reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    /// Correlation id of the answered request.
    pub correlation_id: u64,
    /// Rule-engine payload.
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during envelope decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard encoding or decoding failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize an [`Envelope`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded Envelope]`
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = postcard::to_allocvec(envelope)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into an [`Envelope`].
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, WireError> {
    let (&version, body) = data.split_first().ok_or(WireError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sequenced() -> SequencedMessage {
        SequencedMessage {
            global_id: 77,
            sender_id: PeerId(3),
            sequence: 12,
            timestamp_ms: 1_700_000_000_000,
            requires_ack: true,
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
        }
    }

    #[test]
    fn test_sequenced_message_survives_encoding() {
        let envelope = Envelope::Sequenced(sample_sequenced());
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_ack_is_compact() {
        let envelope = Envelope::Ack(AckMessage {
            peer_id: PeerId(1),
            last_processed_sequence: 5,
            sent_at_ms: 100,
        });
        let bytes = encode_envelope(&envelope).unwrap();
        assert!(bytes.len() < 12, "Ack should be compact, got {} bytes", bytes.len());
    }

    #[test]
    fn test_version_byte_is_first_byte() {
        let bytes = encode_envelope(&Envelope::ResendRequest(ResendRequest {
            from_sequence: 4,
        }))
        .unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = encode_envelope(&Envelope::Logout(Logout {
            reason: "quit".to_string(),
        }))
        .unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode_envelope(&bytes),
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(decode_envelope(&[]), Err(WireError::EmptyPayload)));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        assert!(decode_envelope(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_ack_new_stamps_time() {
        let before = now_millis();
        let ack = AckMessage::new(PeerId(2), 9);
        assert!(ack.sent_at_ms >= before);
        assert_eq!(ack.last_processed_sequence, 9);
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(4).to_string(), "peer#4");
        assert_eq!(HOST_ID, PeerId(0));
    }
}
