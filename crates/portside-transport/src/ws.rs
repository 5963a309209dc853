//! WebSocket frame connection
//!
//! Binary messages carry wire frames one-to-one. Ping/pong are handled by
//! tungstenite; stray text frames are ignored on the primary connection.

use crate::{FrameSink, FrameSource, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

pub struct WsFrameSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

pub struct WsFrameSource<S> {
    source: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket into frame halves
pub fn split_frames<S>(ws: WebSocketStream<S>) -> (WsFrameSink<S>, WsFrameSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, source) = ws.split();
    (WsFrameSink { sink }, WsFrameSource { source })
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(result) = self.source.next().await {
            match result {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Close(_)) => {
                    debug!("websocket close received");
                    return Ok(None);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("websocket ping/pong");
                }
                Ok(other) => {
                    trace!("ignoring non-binary websocket message: {:?}", other);
                }
                Err(e) => return Err(TransportError::Connection(e.to_string())),
            }
        }
        Ok(None)
    }
}
