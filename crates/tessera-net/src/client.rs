//! TCP client that joins a [`ReliableServer`](crate::server::ReliableServer).
//!
//! Manages the full session lifecycle: the handshake, transparent resume
//! after a dropped connection, and clean logout. When the connection drops
//! while the session is live, the client redials with exponential backoff
//! and offers the new connection as a resume; the host either swaps it in
//! or starts a fresh session if the old one already expired.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_config::ReliabilityConfig;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;

use crate::framing::{FrameConfig, FrameError, read_frame};
use crate::hub::{EventSink, PeerHub};
use crate::messages::{HOST_ID, PeerId};
use crate::peer::{PeerError, PeerState, SendStatus};
use crate::reconnection::{BackoffConfig, ReconnectError, retry};
use crate::server::run_ticks;
use crate::transport::{TcpTransport, Transport};

/// Errors surfaced by [`ReliableClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The session refused the operation.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The host did not answer the handshake in time.
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
}

/// Handle to a session with one host.
pub struct ReliableClient {
    hub: Arc<PeerHub>,
    /// Sending `true` stops the reader and tick tasks.
    shutdown_tx: watch::Sender<bool>,
}

async fn open(
    addr: SocketAddr,
    config: &ReliabilityConfig,
) -> io::Result<(Arc<dyn Transport>, OwnedReadHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (transport, reader) = TcpTransport::from_stream(stream, config)?;
    Ok((Arc::new(transport), reader))
}

impl ReliableClient {
    /// Connect to the host at `addr` and send the handshake. Returns once
    /// the TCP connection is up; use
    /// [`wait_connected`](Self::wait_connected) to wait for the host's
    /// answer.
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        config: &ReliabilityConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ClientError> {
        let hub = Arc::new(PeerHub::client(config, name, sink));
        let (transport, reader) = open(addr, config).await?;
        hub.connect(Arc::clone(&transport))?;
        tracing::info!("Connecting to {addr} as {name}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_session(
            Arc::clone(&hub),
            addr,
            config.clone(),
            transport,
            reader,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_ticks(Arc::clone(&hub), config.clone(), shutdown_rx));

        Ok(Self { hub, shutdown_tx })
    }

    /// The hub holding the host connection.
    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    /// Id the host assigned to this client. [`HOST_ID`] until welcomed.
    pub fn local_id(&self) -> PeerId {
        self.hub.local_id()
    }

    /// State of the host connection.
    pub fn state(&self) -> PeerState {
        self.hub
            .peer(HOST_ID)
            .map_or(PeerState::Disconnected, |peer| peer.state())
    }

    /// Wait until the host connection is `Connected`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let peer = self
            .hub
            .peer(HOST_ID)
            .ok_or(PeerError::UnknownPeer(HOST_ID))?;
        let mut states = peer.subscribe();
        match tokio::time::timeout(timeout, states.wait_for(|s| *s == PeerState::Connected)).await
        {
            Ok(Ok(_)) => Ok(()),
            _ => Err(ClientError::HandshakeTimeout(timeout)),
        }
    }

    /// Send a payload to the host.
    pub fn send(&self, payload: Vec<u8>, requires_ack: bool) -> Result<SendStatus, ClientError> {
        Ok(self.hub.send_to_peer(HOST_ID, payload, requires_ack)?)
    }

    /// Send a request and block the calling worker thread for the reply.
    ///
    /// Never call this from the I/O reactor; use `spawn_blocking`.
    pub fn send_and_wait(&self, payload: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        Ok(self.hub.send_and_wait(HOST_ID, payload)?)
    }

    /// Log out and stop the background tasks.
    pub fn logout(&self, reason: &str) -> Result<(), ClientError> {
        let _ = self.shutdown_tx.send(true);
        match self.hub.logout(HOST_ID, reason) {
            Ok(()) | Err(PeerError::UnknownPeer(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ReliableClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum ReadEnd {
    Lost,
    Shutdown,
}

async fn read_until_lost(
    hub: &PeerHub,
    reader: &mut OwnedReadHalf,
    frame: &FrameConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ReadEnd {
    loop {
        tokio::select! {
            result = read_frame(reader, frame) => {
                match result {
                    Ok(bytes) => {
                        if let Err(e) = hub.handle_frame(HOST_ID, &bytes) {
                            tracing::warn!("frame from host rejected: {e}");
                        }
                    }
                    Err(FrameError::ConnectionClosed) => return ReadEnd::Lost,
                    Err(e) => {
                        tracing::warn!("read from host failed: {e}");
                        return ReadEnd::Lost;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return ReadEnd::Shutdown;
                }
            }
        }
    }
}

/// Reader loop that survives connection loss by resuming the session.
async fn run_session(
    hub: Arc<PeerHub>,
    addr: SocketAddr,
    config: ReliabilityConfig,
    mut transport: Arc<dyn Transport>,
    mut reader: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let frame = FrameConfig::from(&config);
    loop {
        if let ReadEnd::Shutdown =
            read_until_lost(&hub, &mut reader, &frame, &mut shutdown_rx).await
        {
            return;
        }
        hub.transport_lost(HOST_ID, &transport);

        if hub.peer(HOST_ID).map(|peer| peer.state()) != Some(PeerState::Reconnecting) {
            tracing::info!("Session with {addr} ended");
            return;
        }

        let backoff = BackoffConfig::default().within_grace(config.reconnect_grace());
        let redial: Result<_, ReconnectError> = tokio::select! {
            result = retry(backoff, || open(addr, &config)) => result,
            _ = shutdown_rx.changed() => return,
        };
        let (fresh, fresh_reader) = match redial {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("Could not reach {addr} again: {e}");
                return;
            }
        };
        if let Err(e) = hub.resume(Arc::clone(&fresh)) {
            tracing::warn!("Resume not possible: {e}");
            fresh.close();
            return;
        }
        transport = fresh;
        reader = fresh_reader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ReliableServer;
    use tessera_config::Config;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    }

    impl EventSink for ChannelSink {
        fn deliver(&self, from: PeerId, payload: Vec<u8>) {
            let _ = self.tx.send((from, payload));
        }

        fn on_request(&self, _from: PeerId, payload: Vec<u8>) -> Option<Vec<u8>> {
            Some(payload.into_iter().rev().collect())
        }
    }

    type Inbox = mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>;

    fn sink() -> (Arc<ChannelSink>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { tx }), rx)
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.reliability.tick_interval_ms = 10;
        config.reliability.reply_timeout_secs = 5;
        config
    }

    async fn start_server() -> (SocketAddr, Arc<ReliableServer>, Inbox) {
        let (sink, inbox) = sink();
        let server = Arc::new(ReliableServer::new(&config(), sink));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        (addr, server, inbox)
    }

    async fn joined(addr: SocketAddr) -> (ReliableClient, Inbox) {
        let (sink, inbox) = sink();
        let client = ReliableClient::connect(addr, "alice", &config().reliability, sink)
            .await
            .unwrap();
        client.wait_connected(Duration::from_secs(5)).await.unwrap();
        (client, inbox)
    }

    async fn next(inbox: &mut Inbox) -> (PeerId, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("delivery within timeout")
            .expect("sink alive")
    }

    #[tokio::test]
    async fn test_client_joins_and_exchanges_messages() {
        let (addr, server, mut server_inbox) = start_server().await;
        let (client, mut client_inbox) = joined(addr).await;
        assert_eq!(client.state(), PeerState::Connected);
        assert_eq!(client.local_id(), PeerId(1));

        for i in 0..3u8 {
            client.send(vec![i], true).unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(next(&mut server_inbox).await, (PeerId(1), vec![i]));
        }

        server
            .hub()
            .send_to_peer(PeerId(1), b"state".to_vec(), true)
            .unwrap();
        assert_eq!(next(&mut client_inbox).await, (HOST_ID, b"state".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_request_answered() {
        let (addr, _server, _inbox) = start_server().await;
        let (client, _client_inbox) = joined(addr).await;
        let client = Arc::new(client);

        let worker = Arc::clone(&client);
        let reply = tokio::task::spawn_blocking(move || worker.send_and_wait(b"abc".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"cba");
    }

    #[tokio::test]
    async fn test_resumes_after_connection_drop() {
        let (addr, server, mut server_inbox) = start_server().await;
        let (client, _client_inbox) = joined(addr).await;
        let id = client.local_id();

        let peer = server.hub().peer(id).unwrap();
        peer.transport().unwrap().close();

        let host = client.hub().peer(HOST_ID).unwrap();
        let mut states = host.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == PeerState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();
        client.send(b"after".to_vec(), true).unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == PeerState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(next(&mut server_inbox).await, (id, b"after".to_vec()));
        assert_eq!(client.local_id(), id);
        assert_eq!(server.hub().connected_count(), 1);
    }

    #[tokio::test]
    async fn test_logout_removes_peer_from_host() {
        let (addr, server, _inbox) = start_server().await;
        let (client, _client_inbox) = joined(addr).await;
        client.logout("bye").unwrap();
        assert_eq!(client.state(), PeerState::Disconnected);

        let mut attempts = 0;
        while server.hub().peer(PeerId(1)).is_some() && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            attempts += 1;
        }
        assert!(server.hub().peer(PeerId(1)).is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (sink, _inbox) = sink();
        let result = ReliableClient::connect(addr, "x", &ReliabilityConfig::default(), sink).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
