//! # hpx-wsengine
//!
//! WebSocket (RFC 6455) frame engine with permessage-deflate compression (RFC 7692).
//!
//! The crate starts where the HTTP upgrade ends: it takes an established byte stream and
//! runs the protocol on top of it. It covers
//!
//! - frame header encoding and decoding, masking, and compression,
//! - pooled frame buffers and a pool of deflate/inflate instances shared by all connections,
//! - a per-connection write scheduler that serializes socket writes,
//! - the close handshake, driven by an exactly-once state machine,
//! - a [`Broadcaster`] that builds a frame once and writes it to many connections.
//!
//! # Features
//! - `simd`: SIMD-accelerated UTF-8 validation
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use hpx_wsengine::{Config, Conn, EventHandler, Message, Options, Role};
//! use tokio::net::TcpStream;
//!
//! struct Echo;
//!
//! impl EventHandler<TcpStream> for Echo {
//!     fn on_message(&self, socket: &Arc<Conn<TcpStream>>, message: Message) {
//!         let _ = socket.write_async(message.opcode(), message.payload());
//!     }
//! }
//!
//! async fn serve(stream: TcpStream) {
//!     // the HTTP upgrade has already been answered on `stream`
//!     let config = Config::new(&Options::default().with_utf8(), Role::Server);
//!     let socket = Conn::new(Role::Server, stream, Default::default(), config, false, Echo);
//!     socket.read_loop().await;
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod broadcast;
pub mod close;
pub mod compression;
pub mod conn;
pub mod event;
pub mod frame;
#[doc(hidden)]
pub mod mask;
pub mod options;
pub mod pool;
mod reader;
pub mod scheduler;
pub mod transport;
pub mod writer;

use std::io;

pub use broadcast::Broadcaster;
use bytes::Bytes;
pub use close::{CloseCode, CloseOrigin, CloseOutcome};
pub use compression::{CompressionLevel, CompressorPool};
pub use conn::Conn;
pub use event::{EventHandler, Message};
pub use frame::{FrameHeader, OpCode, Role};
pub use options::{Config, Options};
pub use pool::{BufferPool, PooledBuf};
pub use scheduler::WorkerQueue;
use thiserror::Error;
pub use transport::Transport;
pub use writer::Frame;

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur while framing, sending or receiving.
///
/// Every variant except [`WebSocketError::ConnectionClosed`] can end a connection; the
/// status code sent to the peer in that case is given by [`WebSocketError::close_code`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Text or close payload is not valid UTF-8.
    #[error("Invalid UTF-8 payload")]
    UnsupportedData,

    /// Payload exceeds the configured read or write limit.
    #[error("Message too large")]
    MessageTooLarge,

    /// Peer (or caller) violated RFC 6455.
    #[error("Protocol error: {0}")]
    ProtocolError(&'static str),

    /// Connection has been closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Close requested by the application with an explicit status code.
    ///
    /// A `code` of zero closes with an empty close payload. The reason goes on the wire as
    /// given, whether or not it is valid UTF-8.
    #[error("{}", String::from_utf8_lossy(reason))]
    Close { code: u16, reason: Bytes },

    /// Deflate or inflate failure.
    #[error("Compression error: {0}")]
    Compression(io::Error),

    /// I/O error.
    #[error(transparent)]
    IoError(#[from] io::Error),
}

impl WebSocketError {
    /// Status code carried by the close frame this error produces.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::UnsupportedData => CloseCode::INVALID_PAYLOAD.into(),
            Self::MessageTooLarge => CloseCode::MESSAGE_TOO_BIG.into(),
            Self::ProtocolError(_) => CloseCode::PROTOCOL_ERROR.into(),
            Self::Close { code, .. } => *code,
            Self::ConnectionClosed | Self::Compression(_) | Self::IoError(_) => {
                CloseCode::NORMAL.into()
            }
        }
    }

    /// Reason carried by the close frame this error produces.
    pub(crate) fn close_reason(&self) -> Bytes {
        match self {
            Self::Close { reason, .. } => reason.clone(),
            other => Bytes::from(other.to_string()),
        }
    }

    /// Returns `true` if this is a protocol-level error (RFC 6455 violation).
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::ProtocolError(_))
    }

    /// Returns `true` if the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns `true` if this is a data validation error (invalid UTF-8 or size limit).
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::UnsupportedData | Self::MessageTooLarge)
    }

    /// Returns `true` if this wraps an I/O error.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::IoError(_))
    }

    /// Returns the underlying I/O error, if any.
    pub fn as_io_error(&self) -> Option<&io::Error> {
        match self {
            Self::IoError(e) | Self::Compression(e) => Some(e),
            _ => None,
        }
    }

    /// Copies the error for callers that share one cached failure.
    ///
    /// I/O errors keep their kind and message but lose their source chain.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::UnsupportedData => Self::UnsupportedData,
            Self::MessageTooLarge => Self::MessageTooLarge,
            Self::ProtocolError(msg) => Self::ProtocolError(msg),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Close { code, reason } => Self::Close {
                code: *code,
                reason: reason.clone(),
            },
            Self::Compression(e) => Self::Compression(io::Error::new(e.kind(), e.to_string())),
            Self::IoError(e) => Self::IoError(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Validates UTF-8, using SIMD when the `simd` feature is enabled.
#[inline]
pub(crate) fn is_valid_utf8(payload: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(payload).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(payload).is_ok()
    }
}
