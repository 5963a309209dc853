//! Backend-side entry point
//!
//! `dial` establishes the persistent WebSocket to the relay and runs the
//! endpoint serve loop over it; the returned [`Endpoint`] is the accept queue
//! of streams the relay opens. Side connections requested by the relay are
//! dialed back through [`WsSideDialer`] with the rendezvous key and the same
//! bearer token.

use async_trait::async_trait;
use portside_endpoint::{Endpoint, EndpointError, SideStream};
use portside_proto::{SessionKey, TunnelOptions};
use portside_transport::{ws, BoxedIo};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{client_async_tls, connect_async, WebSocketStream};
use tracing::{debug, info};
use url::Url;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("routing failed: {0}")]
    Route(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid bearer token")]
    InvalidToken,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Decides which relay to dial and which token to present
#[async_trait]
pub trait Router: Send + Sync {
    /// Returns `(host, token)`; the token may be empty.
    async fn route(&self) -> Result<(String, String), ClientError>;
}

/// The trivial router: one fixed relay, one fixed token
pub struct StaticRouter {
    pub host: String,
    pub token: String,
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(&self) -> Result<(String, String), ClientError> {
        Ok((self.host.clone(), self.token.clone()))
    }
}

/// Supplies the raw stream under a handshake, for callers that need custom
/// binding or an upstream proxy. `None` means a plain TCP connect.
#[async_trait]
pub trait NetDialer: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedIo, ClientError>;
}

/// How the persistent connection is established
#[derive(Clone)]
pub struct DialOption {
    /// URL path of the endpoint upgrade on the relay
    pub path: String,
    pub dialer: Option<Arc<dyn NetDialer>>,
    pub tunnel_options: TunnelOptions,
    /// Dial `ws://` instead of `wss://` (local development relays)
    pub without_tls: bool,
}

impl Default for DialOption {
    fn default() -> Self {
        Self {
            path: "/endpoint".to_string(),
            dialer: None,
            tunnel_options: TunnelOptions::default(),
            without_tls: false,
        }
    }
}

/// Establish the persistent connection and run the endpoint serve loop.
pub async fn dial(
    router: Arc<dyn Router>,
    options: DialOption,
) -> Result<(Endpoint, JoinHandle<Result<(), EndpointError>>), ClientError> {
    let (host, token) = router.route().await?;
    let request = endpoint_request(&host, &options, &token)?;
    info!(%host, siding = options.tunnel_options.siding, "dialing relay");

    let side_dialer = Arc::new(WsSideDialer {
        token,
        dialer: options.dialer.clone(),
        without_tls: options.without_tls,
    });

    match &options.dialer {
        Some(dialer) => {
            let (host, port) = request_target(&request)?;
            let stream = dialer.connect(&host, port).await?;
            let (ws_stream, _response) = client_async_tls(request, stream).await?;
            Ok(run_serve(ws_stream, side_dialer))
        }
        None => {
            let (ws_stream, _response) = connect_async(request).await?;
            Ok(run_serve(ws_stream, side_dialer))
        }
    }
}

fn run_serve<S>(
    ws_stream: WebSocketStream<S>,
    side_dialer: Arc<WsSideDialer>,
) -> (Endpoint, JoinHandle<Result<(), EndpointError>>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, source) = ws::split_frames(ws_stream);
    Endpoint::serve(sink, source, side_dialer)
}

/// Host and port a custom dialer should connect to for this request
fn request_target(request: &Request) -> Result<(String, u16), ClientError> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| ClientError::Route("request has no host".to_string()))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });
    Ok((host.to_string(), port))
}

/// Handshake request for the persistent connection: `opt` JSON query plus
/// the bearer token.
fn endpoint_request(host: &str, options: &DialOption, token: &str) -> Result<Request, ClientError> {
    let scheme = if options.without_tls { "ws" } else { "wss" };
    let mut url = Url::parse(&format!("{scheme}://{host}{}", options.path))?;
    url.query_pairs_mut()
        .append_pair("opt", &options.tunnel_options.to_query());
    with_bearer(url, token)
}

/// Handshake request for a dedicated side connection: the relay-supplied
/// address plus the `side` rendezvous key query.
fn side_request(
    addr: &str,
    key: SessionKey,
    token: &str,
    without_tls: bool,
) -> Result<Request, ClientError> {
    let mut url = Url::parse(addr)?;
    if without_tls && url.scheme() == "wss" {
        let _ = url.set_scheme("ws");
    }
    url.query_pairs_mut().append_pair("side", &key.to_query());
    with_bearer(url, token)
}

fn with_bearer(url: Url, token: &str) -> Result<Request, ClientError> {
    let mut request = url.as_str().into_client_request()?;
    if !token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ClientError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Dials the dedicated side WebSocket back to the relay
pub struct WsSideDialer {
    token: String,
    dialer: Option<Arc<dyn NetDialer>>,
    without_tls: bool,
}

#[async_trait]
impl portside_endpoint::SideDialer for WsSideDialer {
    async fn dial(
        &self,
        addr: &str,
        token: &str,
        key: SessionKey,
    ) -> Result<BoxedIo, EndpointError> {
        // A per-dial token from the relay overrides the connection token.
        let token = if token.is_empty() { &self.token } else { token };
        let request = side_request(addr, key, token, self.without_tls)
            .map_err(|e| EndpointError::Side(e.to_string()))?;
        debug!(%addr, session = key.id, "dialing side connection");

        match &self.dialer {
            Some(dialer) => {
                let (host, port) =
                    request_target(&request).map_err(|e| EndpointError::Side(e.to_string()))?;
                let stream = dialer
                    .connect(&host, port)
                    .await
                    .map_err(|e| EndpointError::Side(e.to_string()))?;
                let (ws_stream, _response) = client_async_tls(request, stream)
                    .await
                    .map_err(|e| EndpointError::Side(e.to_string()))?;
                Ok(SideStream::new(ws_stream).into_io())
            }
            None => {
                let (ws_stream, _response) = connect_async(request)
                    .await
                    .map_err(|e| EndpointError::Side(e.to_string()))?;
                Ok(SideStream::new(ws_stream).into_io())
            }
        }
    }
}
