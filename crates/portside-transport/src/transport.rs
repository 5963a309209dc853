//! Per-connection multiplexing call engine
//!
//! One owner task holds the pending-call map and performs every write, so
//! frames from one transport are never interleaved and the map needs no lock.
//! One reader task parses incoming frames and forwards completions to the
//! owner over a channel.

use crate::{FrameSink, FrameSource, TransportError, TransportResult};
use bytes::Bytes;
use portside_proto::{FrameType, Message, RemoteErr, RequestFrame, ResponseFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Bound on the outbound call queue; provides natural backpressure on callers
pub const CALL_QUEUE_CAPACITY: usize = 128;

enum Submission {
    Call {
        message: Message,
        done: oneshot::Sender<TransportResult<Bytes>>,
    },
    /// Fire-and-forget frame, never registered as pending
    OneWay { message: Message },
}

struct Completion {
    id: u64,
    result: TransportResult<Bytes>,
}

/// Cheaply clonable handle to one connection's call engine
#[derive(Clone)]
pub struct Transport {
    submit_tx: mpsc::Sender<Submission>,
    shut: Arc<AtomicBool>,
    closed: CancellationToken,
    conn_id: Arc<String>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("conn_id", &self.conn_id)
            .field("shut", &self.shut.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transport {
    /// Spawn the owner and reader tasks over an established frame connection
    pub fn new(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(CALL_QUEUE_CAPACITY);
        let (resp_tx, resp_rx) = mpsc::channel(CALL_QUEUE_CAPACITY);
        let closed = CancellationToken::new();
        let conn_id = Arc::new(format!("tp-{}", uuid::Uuid::new_v4()));

        let transport = Self {
            submit_tx,
            shut: Arc::new(AtomicBool::new(false)),
            closed: closed.clone(),
            conn_id: conn_id.clone(),
        };

        tokio::spawn(owner_task(sink, submit_rx, resp_rx, closed, conn_id));
        tokio::spawn(reader_task(source, resp_tx, transport.clone()));

        transport
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Issue one call and wait for its completion
    pub async fn call(&self, message: Message) -> TransportResult<Bytes> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyShutdown);
        }
        self.submit(message).await
    }

    /// Like [`call`](Self::call), but the wait can be abandoned.
    ///
    /// Cancellation aborts only the caller's wait: the wire request is not
    /// retracted and may still complete; the late response is then discarded
    /// by the owner task with a debug log, since the single-use completion
    /// slot is gone.
    pub async fn call_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> TransportResult<Bytes> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyShutdown);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.submit_tx
            .send(Submission::Call {
                message,
                done: done_tx,
            })
            .await
            .map_err(|_| TransportError::UnexpectedEos)?;
        tokio::select! {
            result = done_rx => result.map_err(|_| TransportError::UnexpectedEos)?,
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    async fn submit(&self, message: Message) -> TransportResult<Bytes> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit_tx
            .send(Submission::Call {
                message,
                done: done_tx,
            })
            .await
            .map_err(|_| TransportError::UnexpectedEos)?;
        done_rx.await.map_err(|_| TransportError::UnexpectedEos)?
    }

    /// Negotiate graceful shutdown.
    ///
    /// The first caller sends the Shutdown frame; repeated calls return
    /// immediately without double-sending. After the guard flips, new call
    /// submissions fail with `AlreadyShutdown` while already-pending calls
    /// drain. The peer finishes its dispatched work before closing, which
    /// ends our reader and force-completes anything still pending.
    pub async fn shutdown(&self) -> TransportResult<()> {
        if self.shut.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("[{}] negotiating shutdown", self.conn_id);
        match self.submit(Message::Shutdown).await {
            Ok(_) => Ok(()),
            // The peer may close the stream instead of answering; both mean done.
            Err(err) if err.is_eos() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// One-way notice asking the peer to begin its own graceful shutdown
    /// proactively (e.g. ahead of a forced restart). Never answered.
    pub async fn send_shutdown_hint(&self) {
        let _ = self
            .submit_tx
            .send(Submission::OneWay {
                message: Message::ShutdownHint,
            })
            .await;
    }

    /// One-way condition report. Fire-and-forget, never answered.
    pub async fn report_status(&self, err: RemoteErr) {
        let _ = self
            .submit_tx
            .send(Submission::OneWay {
                message: Message::Status { err },
            })
            .await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    /// Token cancelled once the connection is fully torn down
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

async fn owner_task(
    mut sink: impl FrameSink,
    mut submit_rx: mpsc::Receiver<Submission>,
    mut resp_rx: mpsc::Receiver<Completion>,
    closed: CancellationToken,
    conn_id: Arc<String>,
) {
    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<TransportResult<Bytes>>> = HashMap::new();

    loop {
        tokio::select! {
            submission = submit_rx.recv() => {
                let Some(submission) = submission else { break };
                match submission {
                    Submission::OneWay { message } => {
                        let frame = RequestFrame::new(0, message).encode();
                        if let Err(e) = sink.send(frame).await {
                            debug!("[{conn_id}] one-way send failed: {e}");
                            break;
                        }
                    }
                    Submission::Call { message, done } => {
                        let id = next_id;
                        next_id += 1;
                        let frame_type = message.frame_type();
                        let frame = RequestFrame::new(id, message).encode();
                        if let Err(e) = sink.send(frame).await {
                            let _ = done.send(Err(TransportError::Connection(e.to_string())));
                            break;
                        }
                        trace!("[{conn_id}] call {id} ({frame_type:?}) sent");
                        if let Some(stale) = pending.insert(id, done) {
                            // Ids are monotonic, so a collision means a bug.
                            warn!("[{conn_id}] call id {id} collided with a pending entry");
                            let _ = stale.send(Err(TransportError::PendingTooLong(id)));
                        }
                    }
                }
            }
            completion = resp_rx.recv() => {
                let Some(Completion { id, result }) = completion else { break };
                match pending.remove(&id) {
                    Some(done) => {
                        if done.send(result).is_err() {
                            debug!("[{conn_id}] response for call {id} discarded, caller gave up waiting");
                        }
                    }
                    None => debug!("[{conn_id}] response for unknown call {id}"),
                }
            }
        }
    }

    // Reader ended or the connection broke: every still-pending call and
    // every queued submission completes exactly once with end-of-stream.
    for (_, done) in pending.drain() {
        let _ = done.send(Err(TransportError::UnexpectedEos));
    }
    submit_rx.close();
    while let Ok(submission) = submit_rx.try_recv() {
        if let Submission::Call { done, .. } = submission {
            let _ = done.send(Err(TransportError::UnexpectedEos));
        }
    }
    sink.close().await;
    closed.cancel();
    debug!("[{conn_id}] transport owner task ended");
}

async fn reader_task(
    mut source: impl FrameSource,
    resp_tx: mpsc::Sender<Completion>,
    transport: Transport,
) {
    loop {
        match source.recv().await {
            Ok(Some(raw)) => match ResponseFrame::decode(raw) {
                Ok(frame) if frame.frame_type == FrameType::ShutdownHint => {
                    info!(
                        "[{}] peer hinted shutdown, draining proactively",
                        transport.conn_id()
                    );
                    let handle = transport.clone();
                    tokio::spawn(async move {
                        let _ = handle.shutdown().await;
                    });
                }
                Ok(frame) => {
                    let id = frame.id;
                    let result = frame.into_result().map_err(TransportError::from);
                    if resp_tx.send(Completion { id, result }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // One connection hosts many sessions; a corrupted frame
                    // boundary cannot be attributed, so the whole transport
                    // comes down.
                    error!("[{}] frame decode failed: {e}", transport.conn_id());
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] read error: {e}", transport.conn_id());
                break;
            }
        }
    }
    debug!("[{}] transport reader task ended", transport.conn_id());
}
