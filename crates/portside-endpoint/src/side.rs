//! Side-connection adapter: one dedicated WebSocket as a byte stream
//!
//! Binary frames are opaque payload chunks of at most
//! [`SIDE_CHUNK_SIZE`](portside_proto::SIDE_CHUNK_SIZE) bytes; a single text
//! frame carrying the literal payload `EOF` is the graceful half-close,
//! distinguished from abrupt socket closure.

use crate::{EndpointError, DUPLEX_BUFFER};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use portside_proto::{SIDE_CHUNK_SIZE, SIDE_EOF_MARK};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Bound on socket close so `close` never hangs indefinitely
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SideStream<S> {
    ws: WebSocketStream<S>,
    carry: BytesMut,
    eof: bool,
    closed: bool,
}

impl<S> SideStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            carry: BytesMut::new(),
            eof: false,
            closed: false,
        }
    }

    /// Read up to `max` bytes, transparently spanning incoming binary frames.
    /// An empty result is the graceful end of stream.
    pub async fn read(&mut self, max: usize) -> Result<Bytes, EndpointError> {
        loop {
            if !self.carry.is_empty() {
                let n = max.min(self.carry.len());
                return Ok(self.carry.split_to(n).freeze());
            }
            if self.eof {
                return Ok(Bytes::new());
            }
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.carry.extend_from_slice(&data);
                }
                Some(Ok(Message::Text(text))) if text == SIDE_EOF_MARK => {
                    trace!("side connection saw graceful EOF");
                    self.eof = true;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    // Abrupt closure without the EOF marker.
                    return Err(EndpointError::Side(
                        "connection closed without EOF".to_string(),
                    ));
                }
                Some(Ok(other)) => {
                    debug!("ignoring unexpected side frame: {other:?}");
                }
                Some(Err(e)) => return Err(EndpointError::Side(e.to_string())),
            }
        }
    }

    /// Write, chunked into bounded binary frames
    pub async fn write(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        if self.closed {
            return Err(EndpointError::Side("already closed".to_string()));
        }
        for chunk in data.chunks(SIDE_CHUNK_SIZE) {
            self.ws
                .send(Message::Binary(chunk.to_vec()))
                .await
                .map_err(|e| EndpointError::Side(e.to_string()))?;
        }
        Ok(())
    }

    /// Send the EOF marker, then close the socket under a bounded deadline
    pub async fn close(&mut self) -> Result<(), EndpointError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.ws.send(Message::Text(SIDE_EOF_MARK.to_string())).await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
        Ok(())
    }

    /// Adapt into an `AsyncRead + AsyncWrite` stream backed by pump tasks
    pub fn into_io(self) -> portside_transport::BoxedIo {
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        let (mut ws_sink, mut ws_source) = self.ws.split();
        let mut carry = self.carry;
        let already_eof = self.eof;
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        // Outbound: duplex bytes become chunked binary frames; local EOF
        // becomes the marker plus a bounded socket close.
        tokio::spawn(async move {
            let mut buf = vec![0u8; SIDE_CHUNK_SIZE];
            loop {
                match remote_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if ws_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = ws_sink.send(Message::Text(SIDE_EOF_MARK.to_string())).await;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_sink.close()).await;
        });

        // Inbound: binary frames become duplex bytes until the EOF marker.
        tokio::spawn(async move {
            if !carry.is_empty() && remote_write.write_all(&carry.split()).await.is_err() {
                return;
            }
            if already_eof {
                let _ = remote_write.shutdown().await;
                return;
            }
            loop {
                match ws_source.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if remote_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) if text == SIDE_EOF_MARK => {
                        let _ = remote_write.shutdown().await;
                        break;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        // Abrupt closure without the marker: the consumer
                        // still has to observe end of stream.
                        debug!("side connection closed without EOF marker");
                        let _ = remote_write.shutdown().await;
                        break;
                    }
                    Some(Ok(other)) => {
                        debug!("ignoring unexpected side frame: {other:?}");
                    }
                    Some(Err(e)) => {
                        debug!("side connection read failed: {e}");
                        let _ = remote_write.shutdown().await;
                        break;
                    }
                }
            }
        });

        Box::new(local)
    }
}
