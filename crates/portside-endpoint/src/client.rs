//! Endpoint client: the caller role of a relay connection
//!
//! Owned by the relay for each registered endpoint. Plain tunnels go through
//! Dial and [`Tunnel`]; siding-mode tunnels rendezvous a dedicated side
//! WebSocket through the [`Office`] instead, so bulk bytes never ride the
//! control connection.

use crate::office::Office;
use crate::tunnel::Tunnel;
use crate::{EndpointError, SIDE_DIAL_TIMEOUT};
use bytes::Bytes;
use portside_proto::{Decoder, Message, RemoteErr, TunnelOptions};
use portside_transport::{BoxedIo, Transport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Where the backend should dial its side connections, and with what
#[derive(Debug, Clone)]
pub struct SideInfo {
    pub addr: String,
    pub token: String,
}

/// Caller handle over one endpoint's control connection
#[derive(Clone)]
pub struct EndpointClient {
    transport: Transport,
    options: TunnelOptions,
    office: Arc<Office>,
    side: SideInfo,
    identity: String,
}

impl EndpointClient {
    pub fn new(transport: Transport, options: TunnelOptions, side: SideInfo) -> Self {
        Self {
            transport,
            options,
            office: Arc::new(Office::new()),
            side,
            identity: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Distinguishes this registration from a later one under the same name
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    pub fn office(&self) -> Arc<Office> {
        self.office.clone()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Round-trip a liveness probe; the peer echoes the payload back
    pub async fn hello(&self, data: &[u8]) -> Result<Bytes, EndpointError> {
        let payload = self
            .transport
            .call(Message::Hello {
                data: Bytes::copy_from_slice(data),
            })
            .await?;
        let mut dec = Decoder::new(payload);
        let echoed = dec.get_bytes();
        dec.end()?;
        Ok(echoed)
    }

    /// Open a framed tunnel whose bytes ride the control connection
    pub async fn dial_tunnel(&self) -> Result<Tunnel, EndpointError> {
        if self.options.siding {
            return Err(EndpointError::SidingMode);
        }
        let payload = self.transport.call(Message::Dial).await?;
        let mut dec = Decoder::new(payload);
        let session = dec.get_u64();
        dec.end()?;
        trace!(session, "tunnel dialed");
        Ok(Tunnel::new(self.transport.clone(), session))
    }

    /// Open a stream to the endpoint, honoring its negotiated mode
    ///
    /// `peer` is the dialing client's remote address; it is forwarded to the
    /// backend only when the endpoint asked for it.
    pub async fn dial(
        &self,
        peer: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BoxedIo, EndpointError> {
        if !self.options.siding {
            let tunnel = self.dial_tunnel().await?;
            return Ok(tunnel.into_io());
        }

        // The side connection may land before the call response does, so the
        // mailbox has to exist before the request goes out.
        let key = self.office.allocate_key();
        let mut slot = self.office.create(key);

        let token = self.side.token.clone();
        let addr = self.side.addr.clone();
        let message = match peer {
            Some(remote) if self.options.dial_with_addr => Message::DialSide2 {
                key,
                token,
                addr,
                remote_addr: remote.to_string(),
            },
            _ => Message::DialSide { key, token, addr },
        };

        if let Err(e) = self.transport.call_cancellable(message, cancel).await {
            self.office.remove(key.id);
            return Err(e.into());
        }

        tokio::select! {
            io = slot.recv() => match io {
                Some(io) => {
                    trace!(session = key.id, "side connection rendezvoused");
                    Ok(io)
                }
                None => {
                    self.office.remove(key.id);
                    Err(EndpointError::MailboxClosed)
                }
            },
            _ = tokio::time::sleep(SIDE_DIAL_TIMEOUT) => {
                debug!(session = key.id, "side connection never arrived");
                self.office.remove(key.id);
                Err(EndpointError::SideDialTimeout)
            }
            _ = cancel.cancelled() => {
                self.office.remove(key.id);
                Err(EndpointError::Transport(portside_transport::TransportError::Cancelled))
            }
        }
    }

    /// Close one remote session without tearing the connection down
    pub async fn close_session(&self, session: u64) -> Result<(), EndpointError> {
        self.transport.call(Message::Close { session }).await?;
        Ok(())
    }

    /// Negotiated shutdown of the whole connection
    pub async fn shutdown(&self) -> Result<(), EndpointError> {
        self.transport.shutdown().await?;
        Ok(())
    }

    /// Advise the peer to wind down without waiting for it
    pub async fn send_shutdown_hint(&self) {
        self.transport.send_shutdown_hint().await;
    }

    /// Fire-and-forget condition report; the peer logs it and never answers
    pub async fn report_status(&self, err: RemoteErr) {
        self.transport.report_status(err).await;
    }

    /// Cancelled once the underlying connection is fully torn down
    pub fn closed(&self) -> CancellationToken {
        self.transport.closed()
    }
}
