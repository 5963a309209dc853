//! WebSocket serving entry points
//!
//! The external HTTP layer owns listeners, upgrades, and token checks; once
//! it has an upgraded WebSocket it hands the stream here. `serve_endpoint`
//! runs the caller side of a fresh endpoint connection and keeps the name
//! registered for exactly as long as the connection lives. `serve_side`
//! delivers an arriving dedicated side connection to whichever dial is
//! waiting for it.

use crate::registry::EndpointRegistry;
use crate::RelayError;
use portside_endpoint::{EndpointClient, SideInfo, SideStream};
use portside_proto::{SessionKey, TunnelOptions};
use portside_transport::{ws, Transport};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Run the caller side of an endpoint's persistent connection.
///
/// Registers `name` (kicking any live predecessor), holds the registration
/// until the connection tears down, then unregisters with the identity
/// double-check so a kicked connection cannot remove its successor.
pub async fn serve_endpoint<S>(
    ws: WebSocketStream<S>,
    name: &str,
    options: TunnelOptions,
    side: SideInfo,
    registry: Arc<EndpointRegistry>,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, source) = ws::split_frames(ws);
    let transport = Transport::new(sink, source);
    let client = EndpointClient::new(transport, options, side);
    let identity = client.identity().to_string();
    let closed = client.closed();

    info!(%name, %identity, siding = options.siding, "endpoint connection up");
    registry.register(name, client);

    closed.cancelled().await;
    registry.unregister(name, &identity);
    info!(%name, %identity, "endpoint connection down");
    Ok(())
}

/// Deliver an arriving dedicated side connection to the waiting dial.
///
/// Delivery is droppable: if the mailbox is gone (the dialer timed out or
/// was cancelled) the connection is dropped and the backend notices through
/// its own stream.
pub async fn serve_side<S>(
    ws: WebSocketStream<S>,
    name: &str,
    key: SessionKey,
    registry: Arc<EndpointRegistry>,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let client = registry
        .get(name)
        .ok_or_else(|| RelayError::EndpointNotRegistered(name.to_string()))?;

    let io = SideStream::new(ws).into_io();
    if client.office().deliver(key, io) {
        debug!(%name, session = key.id, "side connection delivered");
    } else {
        debug!(%name, session = key.id, "no dial waiting, side connection dropped");
    }
    Ok(())
}
