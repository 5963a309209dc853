//! Tunnel adapter: one multiplexed logical stream as a byte stream
//!
//! Every operation is one RPC on the shared transport; the bytes themselves
//! travel as Read/Write frames on the primary connection.

use crate::{EndpointError, DUPLEX_BUFFER};
use bytes::Bytes;
use portside_proto::{Decoder, Message};
use portside_transport::{BoxedIo, Transport, TransportError};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

/// Read chunk requested per pump iteration when adapting to a byte stream
const PUMP_READ_MAX: u64 = 4096;

pub struct Tunnel {
    transport: Transport,
    session: u64,
}

impl Tunnel {
    pub fn new(transport: Transport, session: u64) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Read up to `max` bytes; an empty result is end-of-stream
    pub async fn read(&self, max: u64) -> Result<Bytes, EndpointError> {
        let result = self
            .transport
            .call(Message::Read {
                session: self.session,
                max,
            })
            .await;
        match result {
            Ok(payload) => {
                let mut dec = Decoder::new(payload);
                let data = dec.get_bytes();
                dec.end().map_err(TransportError::from)?;
                Ok(data)
            }
            // The reserved wire code is the EOS sentinel, not a failure.
            Err(err) if err.is_eos() => Ok(Bytes::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), EndpointError> {
        self.transport
            .call(Message::Write {
                session: self.session,
                data: Bytes::copy_from_slice(data),
            })
            .await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), EndpointError> {
        self.transport
            .call(Message::Close {
                session: self.session,
            })
            .await?;
        Ok(())
    }

    /// Deadline support is a stub: tunnel operations have no per-op timeout.
    /// TODO: plumb a deadline through Read/Write calls once the wire catalog
    /// grows a variant carrying one.
    pub fn set_deadline(&self, _deadline: std::time::Instant) {}

    /// Adapt into an `AsyncRead + AsyncWrite` stream backed by pump tasks
    /// issuing one RPC per chunk.
    pub fn into_io(self) -> BoxedIo {
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        let tunnel = Arc::new(self);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        // Outbound: application bytes become Write calls.
        let out = tunnel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_READ_MAX as usize];
            loop {
                match remote_read.read(&mut buf).await {
                    Ok(0) => {
                        trace!("tunnel {} local writer done", out.session);
                        let _ = out.close().await;
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = out.write(&buf[..n]).await {
                            debug!("tunnel {} write failed: {e}", out.session);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tunnel {} local read failed: {e}", out.session);
                        let _ = out.close().await;
                        break;
                    }
                }
            }
        });

        // Inbound: Read calls become application bytes.
        tokio::spawn(async move {
            loop {
                match tunnel.read(PUMP_READ_MAX).await {
                    Ok(data) if data.is_empty() => {
                        trace!("tunnel {} remote end of stream", tunnel.session);
                        let _ = remote_write.shutdown().await;
                        break;
                    }
                    Ok(data) => {
                        if remote_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tunnel {} read failed: {e}", tunnel.session);
                        let _ = remote_write.shutdown().await;
                        break;
                    }
                }
            }
        });

        Box::new(local)
    }
}
