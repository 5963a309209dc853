//! SNI relay front end
//!
//! Accepts raw TCP connections, sniffs the TLS ClientHello for the server
//! name without terminating TLS, and pumps bytes to whatever the name routes
//! to: a registered endpoint's backend, a plain TCP address, or the relay's
//! own fallback server. The sniffed bytes are replayed verbatim, so the
//! backend observes an untouched TLS stream.

pub mod proxy;
pub mod registry;
pub mod route;
pub mod serve;
pub mod sni;

use thiserror::Error;

pub use proxy::{Dialer, Proxy, RejectPolicy};
pub use registry::{EndpointRegistry, RegistryDialer};
pub use route::{Dest, RouteTable};
pub use serve::{serve_endpoint, serve_side};
pub use sni::TlsHelloInfo;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Endpoint(#[from] portside_endpoint::EndpointError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed client hello: {0}")]
    MalformedHello(String),

    #[error("no route for host: {0}")]
    NoRoute(String),

    #[error("no endpoint registered as: {0}")]
    EndpointNotRegistered(String),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("relay shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Terminal causes that are part of normal operation and only worth a
    /// debug line, as opposed to conditions an operator should see.
    pub fn is_expected(&self) -> bool {
        match self {
            RelayError::Rejected(_) | RelayError::ShuttingDown | RelayError::NoRoute(_) => true,
            RelayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
