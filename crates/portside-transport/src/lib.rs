//! Transport abstraction and per-connection multiplexing engine
//!
//! A [`Transport`] turns arbitrary concurrent calls into correctly-ordered
//! wire frames over any [`FrameSink`]/[`FrameSource`] pair and routes
//! responses back to the right caller. Implementations: WebSocket binary
//! frames ([`ws`]) for real connections, an in-memory pipe ([`mem`]) for
//! tests and demos.

pub mod mem;
pub mod transport;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use portside_proto::{CodecError, RemoteErr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use transport::{Transport, CALL_QUEUE_CAPACITY};

/// Object-safe byte stream, the shape every data path funnels into
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already shut down")]
    AlreadyShutdown,

    #[error("unexpected end of stream")]
    UnexpectedEos,

    #[error("call {0} pending too long")]
    PendingTooLong(u64),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Remote(#[from] RemoteErr),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Remote end-of-stream maps back to the local EOS sentinel, not a failure
    pub fn is_eos(&self) -> bool {
        match self {
            TransportError::UnexpectedEos => true,
            TransportError::Remote(err) => err.is_eof(),
            _ => false,
        }
    }
}

/// Sending half of a frame connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> TransportResult<()>;
    async fn close(&mut self);
}

/// Receiving half of a frame connection
///
/// `recv` yields `None` on orderly end of stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>>;
}
