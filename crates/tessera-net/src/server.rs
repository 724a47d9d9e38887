//! TCP host that accepts peers and runs them through a [`PeerHub`].

use std::sync::Arc;
use std::time::Instant;

use tessera_config::{Config, ReliabilityConfig};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;

use crate::framing::{FrameConfig, FrameError, read_frame};
use crate::hub::{EventSink, PeerHub};
use crate::messages::PeerId;
use crate::peer::PeerError;
use crate::transport::{TcpTransport, Transport};

/// Reliable-session host over TCP.
pub struct ReliableServer {
    bind_addr: String,
    config: ReliabilityConfig,
    hub: Arc<PeerHub>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReliableServer {
    /// Create a server from the network and reliability sections of
    /// `config`. Nothing is bound until [`run`](Self::run).
    pub fn new(config: &Config, sink: Arc<dyn EventSink>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = PeerHub::host(
            &config.reliability,
            config.network.max_peers as usize,
            sink,
        );
        Self {
            bind_addr: format!("{}:{}", config.network.bind_address, config.network.port),
            config: config.reliability.clone(),
            hub: Arc::new(hub),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The hub holding every peer.
    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(run_ticks(
            Arc::clone(&self.hub),
            self.config.clone(),
            self.shutdown_rx.clone(),
        ));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    let (transport, reader) = match TcpTransport::from_stream(stream, &self.config) {
                        Ok(parts) => parts,
                        Err(e) => {
                            tracing::warn!("Could not set up {peer_addr}: {e}");
                            continue;
                        }
                    };
                    let transport: Arc<dyn Transport> = Arc::new(transport);
                    let id = match self.hub.accept(Arc::clone(&transport)) {
                        Ok(id) => id,
                        Err(e) => {
                            tracing::warn!("Rejected {peer_addr}: {e}");
                            continue;
                        }
                    };

                    tokio::spawn(serve_connection(
                        Arc::clone(&self.hub),
                        id,
                        transport,
                        reader,
                        FrameConfig::from(&self.config),
                        self.shutdown_rx.clone(),
                    ));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        self.hub.shutdown("server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server to shut down gracefully. Every peer is logged out.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Per-connection reader loop. The connection starts out as `id` and is
/// rebound when its handshake resumes an earlier session.
async fn serve_connection(
    hub: Arc<PeerHub>,
    mut id: PeerId,
    transport: Arc<dyn Transport>,
    mut reader: OwnedReadHalf,
    frame: FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &frame) => {
                let bytes = match result {
                    Ok(bytes) => bytes,
                    Err(FrameError::ConnectionClosed) => break,
                    Err(e) => {
                        tracing::warn!(peer = %id, "read failed: {e}");
                        break;
                    }
                };
                match hub.handle_frame(id, &bytes) {
                    Ok(bound) => id = bound,
                    Err(PeerError::UnknownPeer(_)) => break,
                    Err(e) => tracing::warn!(peer = %id, "frame rejected: {e}"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    // The accept loop logs every peer out.
                    return;
                }
            }
        }
    }
    hub.transport_lost(id, &transport);
    tracing::info!("Connection {} for {id} closed", transport.describe());
}

/// Housekeeping loop shared by hosts and clients.
pub(crate) async fn run_ticks(
    hub: Arc<PeerHub>,
    config: ReliabilityConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => hub.tick(Instant::now()),
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::write_frame;
    use crate::messages::{Envelope, HOST_ID, Hello, Welcome, decode_envelope, encode_envelope};
    use crate::peer::PeerState;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    }

    impl EventSink for ChannelSink {
        fn deliver(&self, from: PeerId, payload: Vec<u8>) {
            let _ = self.tx.send((from, payload));
        }
    }

    async fn start_test_server(
        max_peers: u32,
    ) -> (
        std::net::SocketAddr,
        Arc<ReliableServer>,
        mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
    ) {
        let mut config = Config::default();
        config.network.max_peers = max_peers;
        config.reliability.tick_interval_ms = 10;
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(ReliableServer::new(&config, Arc::new(ChannelSink { tx })));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        (addr, server, rx)
    }

    async fn send(stream: &mut TcpStream, envelope: &Envelope) {
        let bytes = encode_envelope(envelope).unwrap();
        write_frame(stream, &bytes, &FrameConfig::default()).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Result<Envelope, FrameError> {
        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(stream, &FrameConfig::default()),
        )
        .await
        .expect("frame within timeout")?;
        Ok(decode_envelope(&bytes).unwrap())
    }

    async fn join(stream: &mut TcpStream, name: &str) -> PeerId {
        send(
            stream,
            &Envelope::Hello(Hello {
                name: name.into(),
                resume: None,
            }),
        )
        .await;
        match recv(stream).await.unwrap() {
            Envelope::Welcome(Welcome { peer_id, host_id }) => {
                assert_eq!(host_id, HOST_ID);
                peer_id
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_assigns_ids() {
        let (addr, server, _rx) = start_test_server(4).await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        assert_eq!(join(&mut a, "a").await, PeerId(1));
        assert_eq!(join(&mut b, "b").await, PeerId(2));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.hub().connected_count(), 2);
    }

    #[tokio::test]
    async fn test_sequenced_payload_delivered_and_acked() {
        let (addr, _server, mut rx) = start_test_server(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let id = join(&mut stream, "a").await;

        let message = crate::messages::SequencedMessage {
            global_id: 0,
            sender_id: id,
            sequence: 0,
            timestamp_ms: crate::messages::now_millis(),
            requires_ack: true,
            payload: b"move".to_vec(),
        };
        send(&mut stream, &Envelope::Sequenced(message)).await;

        let (from, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, id);
        assert_eq!(payload, b"move");
        assert!(matches!(
            recv(&mut stream).await.unwrap(),
            Envelope::Ack(ack) if ack.last_processed_sequence == 0
        ));
    }

    #[tokio::test]
    async fn test_peer_limit_closes_extra_connection() {
        let (addr, _server, _rx) = start_test_server(1).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        join(&mut first, "a").await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            recv(&mut second).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_connection_enters_reconnecting() {
        let (addr, server, _rx) = start_test_server(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let id = join(&mut stream, "a").await;
        drop(stream);

        let peer = server.hub().peer(id).unwrap();
        let mut states = peer.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == PeerState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(peer.reconnect_deadline().is_some());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_logs_peers_out() {
        let (addr, server, _rx) = start_test_server(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        join(&mut stream, "a").await;

        server.shutdown();
        assert!(matches!(
            recv(&mut stream).await.unwrap(),
            Envelope::Logout(_)
        ));
        assert!(matches!(
            recv(&mut stream).await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
