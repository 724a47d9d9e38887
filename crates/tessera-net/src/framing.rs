//! Length-prefixed framing for stream transports.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   envelope bytes   |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length excludes the prefix itself. Zero-length frames are legal and
//! carry nothing.

use tessera_config::ReliabilityConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix in bytes.
const PREFIX_LEN: usize = 4;

/// Limits applied by the framing layer.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

impl From<&ReliabilityConfig> for FrameConfig {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_payload_size: config.max_frame_size,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The stream ended before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame and return its payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).await.map_err(eof_as_closed)?;

    let len = u32::from_le_bytes(prefix);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len as u64,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Write one frame (prefix and payload in a single buffer) and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    if payload.len() as u64 > config.max_payload_size as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len() as u64,
            max: config.max_payload_size,
        });
    }

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
