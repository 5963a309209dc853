//! Endpoint roles and stream adapters
//!
//! The two logical roles that share one relay connection: the
//! [`EndpointClient`] (caller, relay side) issuing Dial/Read/Write/Close
//! calls, and the [`EndpointServer`] (callee, backend side) serving them
//! against real local stream connections. [`Endpoint`] composes the server
//! with a listener-style accept queue.

pub mod client;
pub mod office;
pub mod server;
pub mod sessions;
pub mod side;
pub mod tunnel;

use portside_transport::TransportError;
use thiserror::Error;

pub use client::{EndpointClient, SideInfo};
pub use office::Office;
pub use server::{Accepted, Endpoint, EndpointServer, NoSideDialer, SideDialer};
pub use sessions::{Session, SessionRegistry};
pub use side::SideStream;
pub use tunnel::Tunnel;

/// Buffer size of the in-memory duplex pairs backing accepted streams
pub const DUPLEX_BUFFER: usize = 64 * 1024;

/// Capacity of the accept queue fed by Dial / DialSide handlers
pub const ACCEPT_QUEUE_CAPACITY: usize = 64;

/// Bound on waiting for a side connection to rendezvous
pub const SIDE_DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Endpoint errors
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] portside_proto::CodecError),

    #[error("tunnel is in siding mode")]
    SidingMode,

    #[error("session registry already shut down")]
    RegistryShutdown,

    #[error("session not found: {0}")]
    SessionNotFound(u64),

    #[error("mailbox closed")]
    MailboxClosed,

    #[error("side dial timed out")]
    SideDialTimeout,

    #[error("accept queue closed")]
    AcceptClosed,

    #[error("side connection error: {0}")]
    Side(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
