//! Reliability layer for peer-to-peer sessions: per-recipient sequencing,
//! inbound reordering, adaptive flow control, correlated replies, a peer
//! connection state machine with transparent reconnection, and passive
//! metrics. Framing and transports sit underneath, a rule engine on top.

pub mod client;
pub mod flow;
pub mod framing;
pub mod hub;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod reconnection;
pub mod reorder;
pub mod reply_pool;
pub mod sequencer;
pub mod server;
mod sync;
pub mod tracker;
pub mod transport;

pub use client::{ClientError, ReliableClient};
pub use flow::{FlowController, WindowState};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use hub::{EventSink, IdGenerator, NullSink, PeerHub, Role};
pub use messages::{
    AckMessage, Envelope, HOST_ID, PeerId, SequencedMessage, WireError, decode_envelope,
    encode_envelope,
};
pub use metrics::{HealthSnapshot, MetricsCollector, PeerCounters};
pub use peer::{PeerConnection, PeerError, PeerState, Reliability, SendStatus};
pub use reconnection::{Backoff, BackoffConfig, ReconnectError};
pub use reorder::{Accepted, ReorderBuffer, Skipped};
pub use reply_pool::{ReplyError, ReplyPool};
pub use sequencer::{AckOutcome, Sequencer};
pub use server::ReliableServer;
pub use tracker::{FreezeGuard, StateTracker};
pub use transport::{MemoryTransport, TcpTransport, Transport, TransportError, WriteCallback};
