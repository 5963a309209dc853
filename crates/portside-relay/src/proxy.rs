//! The front proxy: sniff, route, pump
//!
//! One task per accepted TCP connection. The TLS stream is never terminated;
//! after the sniffed ClientHello is replayed to the backend the proxy is a
//! plain byte pump in both directions.

use crate::sni;
use crate::RelayError;
use async_trait::async_trait;
use portside_transport::BoxedIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns a sniffed server name into a connected backend stream
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        peer: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BoxedIo, RelayError>;
}

/// Which server names are refused before any backend is dialed
#[derive(Debug, Clone, Default)]
pub struct RejectPolicy {
    abuse_suffixes: Vec<String>,
}

impl RejectPolicy {
    pub fn new(abuse_suffixes: Vec<String>) -> Self {
        Self { abuse_suffixes }
    }

    pub fn check(&self, name: &str) -> Result<(), RelayError> {
        if name.is_empty() {
            return Err(RelayError::Rejected("empty server name".to_string()));
        }
        if name.parse::<std::net::IpAddr>().is_ok() {
            return Err(RelayError::Rejected(format!("ip literal: {name}")));
        }
        for suffix in &self.abuse_suffixes {
            if name.ends_with(suffix.as_str()) {
                return Err(RelayError::Rejected(format!("abusive name: {name}")));
            }
        }
        Ok(())
    }
}

pub struct Proxy {
    dialer: Arc<dyn Dialer>,
    policy: Arc<RejectPolicy>,
    cancel: CancellationToken,
}

impl Proxy {
    pub fn new(dialer: Arc<dyn Dialer>, policy: RejectPolicy) -> Self {
        Self {
            dialer,
            policy: Arc::new(policy),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and all in-flight pumps
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until cancelled.
    pub async fn run(&self, listener: TcpListener) -> Result<(), RelayError> {
        info!("relay listening on {}", listener.local_addr()?);
        loop {
            let (socket, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
                _ = self.cancel.cancelled() => {
                    info!("relay accept loop stopping");
                    return Ok(());
                }
            };

            let dialer = self.dialer.clone();
            let policy = self.policy.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                match handle_connection(socket, peer_addr, dialer, policy, cancel).await {
                    Ok(()) => {}
                    Err(e) if e.is_expected() => debug!("connection from {peer_addr}: {e}"),
                    Err(e) => warn!("connection from {peer_addr}: {e}"),
                }
            });
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    dialer: Arc<dyn Dialer>,
    policy: Arc<RejectPolicy>,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let (info, hello) = sni::read_client_hello(&mut socket).await?;
    let name = info.server_name.unwrap_or_default();
    policy.check(&name)?;
    debug!(%peer_addr, host = %name, alpn = info.first_alpn.as_deref().unwrap_or(""), "proxying");

    let mut backend = dialer
        .dial(&name, Some(&peer_addr.to_string()), &cancel)
        .await?;
    // The backend sees the untouched TLS stream from its first byte.
    backend.write_all(&hello).await?;

    tokio::select! {
        pumped = tokio::io::copy_bidirectional(&mut socket, &mut backend) => {
            let (up, down) = pumped?;
            debug!(%peer_addr, host = %name, up, down, "connection finished");
            Ok(())
        }
        _ = cancel.cancelled() => Err(RelayError::ShuttingDown),
    }
}
