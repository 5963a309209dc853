//! In-memory frame pipe
//!
//! A pair of connected frame endpoints backed by channels, standing in for a
//! real WebSocket in tests and demos.

use crate::{FrameSink, FrameSource, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub struct MemFrameSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

pub struct MemFrameSource {
    rx: mpsc::Receiver<Bytes>,
}

/// Create a connected pair of frame endpoints
pub fn pipe(capacity: usize) -> ((MemFrameSink, MemFrameSource), (MemFrameSink, MemFrameSource)) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        (MemFrameSink { tx: Some(a_tx) }, MemFrameSource { rx: a_rx }),
        (MemFrameSink { tx: Some(b_tx) }, MemFrameSource { rx: b_rx }),
    )
}

#[async_trait]
impl FrameSink for MemFrameSink {
    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::Connection("pipe closed".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::Connection("peer gone".to_string()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[async_trait]
impl FrameSource for MemFrameSource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_delivers_frames() {
        let ((mut a_sink, _a_src), (_b_sink, mut b_src)) = pipe(4);

        a_sink.send(Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(b_src.recv().await.unwrap(), Some(Bytes::from_static(b"frame")));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let ((mut a_sink, _a_src), (_b_sink, mut b_src)) = pipe(4);

        a_sink.close().await;
        assert_eq!(b_src.recv().await.unwrap(), None);
        assert!(a_sink.send(Bytes::new()).await.is_err());
    }
}
