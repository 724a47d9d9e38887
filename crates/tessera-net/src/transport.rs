//! Byte-stream transports consumed by the reliability layer.
//!
//! A [`Transport`] accepts whole envelopes and reports the outcome of each
//! write through a completion callback. Writes never block the caller and
//! never return an error directly.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tessera_config::ReliabilityConfig;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use crate::framing::{FrameConfig, FrameError, write_frame};
use crate::messages::{Envelope, decode_envelope};
use crate::sync::lock;

/// Completion callback invoked exactly once per write.
///
/// Callbacks may run on the caller's thread or on the transport's writer
/// task, so they must not take the owning peer's lock.
pub type WriteCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Errors reported through [`WriteCallback`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed before the write could be performed.
    #[error("transport closed")]
    Closed,

    /// Framing the payload failed.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Bidirectional byte-stream abstraction. Only the outbound half is modelled;
/// inbound frames are pushed into the hub by whoever owns the read side.
pub trait Transport: Send + Sync {
    /// Queue `bytes` as one frame. `on_complete` reports the outcome.
    fn write(&self, bytes: Vec<u8>, on_complete: WriteCallback);

    /// Whether the transport still accepts writes.
    fn is_open(&self) -> bool;

    /// Backpressure signal: `false` when the outbound queue is saturated.
    fn is_writable(&self) -> bool;

    /// Close the transport. Writes queued before the call are still flushed.
    fn close(&self);

    /// Short description for log lines.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

/// Discard the outcome of a write.
pub fn ignore_outcome() -> WriteCallback {
    Box::new(|_| {})
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

enum Command {
    Write(Vec<u8>, WriteCallback),
    Close,
}

/// Transport over any async writer, normally the write half of a TCP stream.
///
/// Frames are handed to a dedicated writer task through an unbounded
/// channel; [`Transport::is_writable`] compares the number of queued bytes
/// against a high-water mark.
pub struct TcpTransport {
    tx: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    high_water: usize,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Spawn the writer task for `writer`. Must be called inside a tokio
    /// runtime.
    pub fn spawn<W>(writer: W, frame: FrameConfig, high_water: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let queued = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_writer(
            writer,
            rx,
            Arc::clone(&open),
            Arc::clone(&queued),
            frame,
        ));

        Self {
            tx,
            open,
            queued,
            high_water,
            peer_addr: None,
        }
    }

    /// Split `stream`, spawn the writer on its write half and return the
    /// read half for the caller's frame reader.
    pub fn from_stream(
        stream: TcpStream,
        config: &ReliabilityConfig,
    ) -> io::Result<(Self, OwnedReadHalf)> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        let mut transport = Self::spawn(
            writer,
            FrameConfig::from(config),
            config.write_high_water,
        );
        transport.peer_addr = peer_addr;
        Ok((transport, reader))
    }

    /// Bytes accepted but not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl Transport for TcpTransport {
    fn write(&self, bytes: Vec<u8>, on_complete: WriteCallback) {
        if !self.is_open() {
            on_complete(Err(TransportError::Closed));
            return;
        }
        let len = bytes.len();
        self.queued.fetch_add(len, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(command)) =
            self.tx.send(Command::Write(bytes, on_complete))
        {
            // Writer task is gone.
            self.queued.fetch_sub(len, Ordering::AcqRel);
            self.open.store(false, Ordering::Release);
            if let Command::Write(_, done) = command {
                done(Err(TransportError::Closed));
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.queued_bytes() < self.high_water
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Close);
        }
    }

    fn describe(&self) -> String {
        match self.peer_addr {
            Some(addr) => format!("tcp://{addr}"),
            None => "tcp".to_string(),
        }
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Command>,
    open: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    frame: FrameConfig,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut failed = false;
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(bytes, done) => {
                let result = if failed {
                    Err(TransportError::Closed)
                } else {
                    write_frame(&mut writer, &bytes, &frame)
                        .await
                        .map_err(TransportError::from)
                };
                queued.fetch_sub(bytes.len(), Ordering::AcqRel);
                if let Err(ref e) = result
                    && !failed
                {
                    tracing::warn!("Transport write failed, closing: {e}");
                    failed = true;
                    open.store(false, Ordering::Release);
                }
                done(result);
            }
            Command::Close => break,
        }
    }

    open.store(false, Ordering::Release);
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let Command::Write(bytes, done) = command {
            queued.fetch_sub(bytes.len(), Ordering::AcqRel);
            done(Err(TransportError::Closed));
        }
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-process transport that records every frame written to it.
///
/// Failure injection makes writes report an I/O error through the callback
/// without closing the transport.
pub struct MemoryTransport {
    frames: Mutex<Vec<Vec<u8>>>,
    open: AtomicBool,
    writable: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryTransport {
    /// Create an open, writable transport.
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Frames written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.frames).clone()
    }

    /// Remove and return the frames written so far.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.frames))
    }

    /// Remove the frames written so far and decode them, skipping any that
    /// fail to decode.
    pub fn take_envelopes(&self) -> Vec<Envelope> {
        self.take_written()
            .iter()
            .filter_map(|bytes| decode_envelope(bytes).ok())
            .collect()
    }

    /// Toggle the backpressure signal.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn write(&self, bytes: Vec<u8>, on_complete: WriteCallback) {
        if !self.is_open() {
            on_complete(Err(TransportError::Closed));
        } else if self.fail_writes.load(Ordering::Acquire) {
            on_complete(Err(TransportError::Io(io::Error::other(
                "injected write failure",
            ))));
        } else {
            lock(&self.frames).push(bytes);
            on_complete(Ok(()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.writable.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
