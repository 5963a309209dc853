//! Endpoint server: the callee role of a relay connection
//!
//! Each incoming request runs on its own task inside a `JoinSet`, joined
//! before the serve loop is considered drained, so a slow blocking Read never
//! stalls other sessions on the same connection. Responses funnel through a
//! single writer task, keeping outgoing frames free of interleaving.

use crate::sessions::SessionRegistry;
use crate::{EndpointError, ACCEPT_QUEUE_CAPACITY, DUPLEX_BUFFER};
use async_trait::async_trait;
use bytes::Bytes;
use portside_proto::{codes, Encoder, FrameType, Message, RemoteErr, RequestFrame, ResponseFrame, SessionKey};
use portside_transport::{BoxedIo, FrameSink, FrameSource, CALL_QUEUE_CAPACITY};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// One stream handed to the local accept queue
pub struct Accepted {
    pub io: BoxedIo,
    /// Real remote address, when the dial carried one (DialSide2)
    pub peer: Option<String>,
}

/// Dials the dedicated WebSocket back to the caller for siding mode
#[async_trait]
pub trait SideDialer: Send + Sync {
    async fn dial(
        &self,
        addr: &str,
        token: &str,
        key: SessionKey,
    ) -> Result<BoxedIo, EndpointError>;
}

/// Placeholder for connections that never serve siding dials
pub struct NoSideDialer;

#[async_trait]
impl SideDialer for NoSideDialer {
    async fn dial(
        &self,
        _addr: &str,
        _token: &str,
        _key: SessionKey,
    ) -> Result<BoxedIo, EndpointError> {
        Err(EndpointError::Side("siding not supported".to_string()))
    }
}

pub struct EndpointServer {
    sessions: Arc<SessionRegistry>,
    accept_tx: mpsc::Sender<Accepted>,
    side_dialer: Arc<dyn SideDialer>,
}

impl EndpointServer {
    pub fn new(accept_tx: mpsc::Sender<Accepted>, side_dialer: Arc<dyn SideDialer>) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            accept_tx,
            side_dialer,
        }
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// Serve requests until the peer negotiates shutdown or the stream ends
    pub async fn serve(
        self,
        mut sink: impl FrameSink + 'static,
        mut source: impl FrameSource + 'static,
    ) -> Result<(), EndpointError> {
        let (resp_tx, mut resp_rx) = mpsc::channel::<ResponseFrame>(CALL_QUEUE_CAPACITY);

        // Single writer task: responses are never interleaved on the wire.
        let writer = tokio::spawn(async move {
            while let Some(frame) = resp_rx.recv().await {
                if let Err(e) = sink.send(frame.encode()).await {
                    debug!("response write failed: {e}");
                    break;
                }
            }
            sink.close().await;
        });

        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut result = Ok(());

        loop {
            tokio::select! {
                frame = source.recv() => match frame {
                    Ok(Some(raw)) => match RequestFrame::decode(raw) {
                        Ok(req) => match req.message {
                            Message::Shutdown => {
                                debug!("shutdown requested, joining {} handler(s)", handlers.len());
                                while handlers.join_next().await.is_some() {}
                                let ack = ResponseFrame::ok(req.id, FrameType::Shutdown, Bytes::new());
                                let _ = resp_tx.send(ack).await;
                                break;
                            }
                            Message::ShutdownHint => {
                                info!("peer hinted shutdown, winding down");
                                break;
                            }
                            message => {
                                let ctx = HandlerContext {
                                    sessions: self.sessions.clone(),
                                    accept_tx: self.accept_tx.clone(),
                                    side_dialer: self.side_dialer.clone(),
                                    resp_tx: resp_tx.clone(),
                                };
                                handlers.spawn(handle_request(req.id, message, ctx));
                            }
                        },
                        Err(e) => {
                            // Frame boundaries are gone; the whole connection
                            // comes down, not one session.
                            error!("request decode failed, closing connection: {e}");
                            result = Err(e.into());
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!("connection read failed: {e}");
                        break;
                    }
                },
                joined = handlers.join_next(), if !handlers.is_empty() => {
                    if let Some(Err(e)) = joined {
                        warn!("handler task failed: {e}");
                    }
                }
            }
        }

        // Drain dispatched work before the connection is declared done.
        while handlers.join_next().await.is_some() {}
        drop(resp_tx);
        let _ = writer.await;

        for session in self.sessions.shutdown() {
            session.close().await;
        }
        result
    }
}

struct HandlerContext {
    sessions: Arc<SessionRegistry>,
    accept_tx: mpsc::Sender<Accepted>,
    side_dialer: Arc<dyn SideDialer>,
    resp_tx: mpsc::Sender<ResponseFrame>,
}

async fn handle_request(id: u64, message: Message, ctx: HandlerContext) {
    let frame_type = message.frame_type();
    let one_way = frame_type == FrameType::Status;
    let outcome = dispatch(message, &ctx).await;
    if one_way {
        return;
    }
    let frame = match outcome {
        Ok(payload) => ResponseFrame::ok(id, frame_type, payload),
        Err(err) => ResponseFrame::err(id, frame_type, &err),
    };
    let _ = ctx.resp_tx.send(frame).await;
}

async fn dispatch(message: Message, ctx: &HandlerContext) -> Result<Bytes, RemoteErr> {
    match message {
        Message::Hello { data } => {
            let mut enc = Encoder::new();
            enc.put_bytes(&data);
            Ok(enc.finish())
        }
        Message::Dial => {
            let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
            let session = ctx
                .sessions
                .register(Box::new(local))
                .map_err(|e| RemoteErr::new(codes::ACCEPT_REFUSED, e.to_string()))?;
            if ctx
                .accept_tx
                .send(Accepted {
                    io: Box::new(remote),
                    peer: None,
                })
                .await
                .is_err()
            {
                let _ = ctx.sessions.remove(session.id());
                return Err(RemoteErr::new(codes::ACCEPT_REFUSED, "accept queue closed"));
            }
            trace!("accepted dial as session {}", session.id());
            let mut enc = Encoder::new();
            enc.put_u64(session.id());
            Ok(enc.finish())
        }
        Message::Read { session, max } => {
            let entry = ctx
                .sessions
                .get(session)
                .map_err(|_| RemoteErr::session_not_found(session))?;
            let data = entry
                .read(max as usize)
                .await
                .map_err(|e| RemoteErr::new(codes::READ, e.to_string()))?;
            if data.is_empty() && max > 0 {
                return Err(RemoteErr::eof());
            }
            let mut enc = Encoder::new();
            enc.put_bytes(&data);
            Ok(enc.finish())
        }
        Message::Write { session, data } => {
            let entry = ctx
                .sessions
                .get(session)
                .map_err(|_| RemoteErr::session_not_found(session))?;
            entry
                .write(&data)
                .await
                .map_err(|e| RemoteErr::new(codes::WRITE, e.to_string()))?;
            Ok(Bytes::new())
        }
        Message::Close { session } => {
            let entry = ctx
                .sessions
                .remove(session)
                .map_err(|_| RemoteErr::session_not_found(session))?;
            entry.close().await;
            Ok(Bytes::new())
        }
        Message::Status { err } => {
            warn!("peer reported condition: {err}");
            Ok(Bytes::new())
        }
        Message::DialSide { key, token, addr } => {
            serve_side_dial(ctx, key, &token, &addr, None).await
        }
        Message::DialSide2 {
            key,
            token,
            addr,
            remote_addr,
        } => serve_side_dial(ctx, key, &token, &addr, Some(remote_addr)).await,
        // Handled inline by the serve loop.
        Message::Shutdown | Message::ShutdownHint => Ok(Bytes::new()),
    }
}

/// Dial the dedicated side WebSocket back to the caller and hand it to the
/// local accept queue. No session registry entry: bytes bypass Read/Write
/// frames entirely.
async fn serve_side_dial(
    ctx: &HandlerContext,
    key: SessionKey,
    token: &str,
    addr: &str,
    peer: Option<String>,
) -> Result<Bytes, RemoteErr> {
    let io = ctx
        .side_dialer
        .dial(addr, token, key)
        .await
        .map_err(|e| RemoteErr::new(codes::ACCEPT_REFUSED, e.to_string()))?;
    if ctx.accept_tx.send(Accepted { io, peer }).await.is_err() {
        return Err(RemoteErr::new(codes::ACCEPT_REFUSED, "accept queue closed"));
    }
    trace!("accepted side connection for session {}", key.id);
    Ok(Bytes::new())
}

/// An endpoint: the serve loop composed with a listener-style accept queue
pub struct Endpoint {
    accept_rx: mpsc::Receiver<Accepted>,
}

impl Endpoint {
    /// Run an [`EndpointServer`] over an established frame connection and
    /// surface its accept queue.
    pub fn serve(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
        side_dialer: Arc<dyn SideDialer>,
    ) -> (Self, tokio::task::JoinHandle<Result<(), EndpointError>>) {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let server = EndpointServer::new(accept_tx, side_dialer);
        let handle = tokio::spawn(server.serve(sink, source));
        (Self { accept_rx }, handle)
    }

    /// Next stream dialed through the relay
    pub async fn accept(&mut self) -> Result<Accepted, EndpointError> {
        self.accept_rx.recv().await.ok_or(EndpointError::AcceptClosed)
    }
}
