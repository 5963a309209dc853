//! Named endpoint registry with kick semantics

use crate::proxy::Dialer;
use crate::route::{Dest, RouteTable};
use crate::RelayError;
use dashmap::DashMap;
use portside_endpoint::EndpointClient;
use portside_transport::BoxedIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Endpoints currently registered by name
///
/// A name belongs to exactly one live connection. Registering over a live
/// name kicks the superseded connection: the new registration wins
/// immediately and the old client is shut down off the registration path.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, EndpointClient>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, client: EndpointClient) {
        let name = name.into();
        info!(%name, identity = client.identity(), "endpoint registered");
        if let Some(old) = self.endpoints.insert(name.clone(), client) {
            info!(%name, identity = old.identity(), "kicking superseded endpoint");
            tokio::spawn(async move {
                if let Err(e) = old.shutdown().await {
                    warn!("kicked endpoint shutdown failed: {e}");
                }
            });
        }
    }

    /// Remove the registration only if it is still the same connection.
    ///
    /// A kicked connection's deferred unregister must not take out its
    /// successor, so the caller proves which registration it owns.
    pub fn unregister(&self, name: &str, identity: &str) -> bool {
        let removed = self
            .endpoints
            .remove_if(name, |_, client| client.identity() == identity)
            .is_some();
        if removed {
            info!(%name, identity, "endpoint unregistered");
        } else {
            debug!(%name, identity, "stale unregister ignored");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<EndpointClient> {
        self.endpoints.get(name).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Resolves hostnames through a [`RouteTable`] and dials the matched
/// destination: a registered endpoint, a plain TCP address, or the relay's
/// own fallback server.
pub struct RegistryDialer {
    registry: Arc<EndpointRegistry>,
    routes: Arc<RouteTable>,
    home_addr: Option<String>,
}

impl RegistryDialer {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        routes: Arc<RouteTable>,
        home_addr: Option<String>,
    ) -> Self {
        Self {
            registry,
            routes,
            home_addr,
        }
    }
}

#[async_trait::async_trait]
impl Dialer for RegistryDialer {
    async fn dial(
        &self,
        host: &str,
        peer: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BoxedIo, RelayError> {
        let dest = match self.routes.lookup(host) {
            Some(dest) => dest,
            // Unrouted names fall through to the home server when one exists.
            None if self.home_addr.is_some() => Dest::Home,
            None => return Err(RelayError::NoRoute(host.to_string())),
        };
        match dest {
            Dest::Endpoint(name) => {
                let client = self
                    .registry
                    .get(&name)
                    .ok_or_else(|| RelayError::EndpointNotRegistered(name.clone()))?;
                debug!(%host, endpoint = %name, "dialing registered endpoint");
                Ok(client.dial(peer, cancel).await?)
            }
            Dest::Tcp(addr) => {
                debug!(%host, %addr, "dialing tcp forward");
                let stream = TcpStream::connect(&addr).await?;
                Ok(Box::new(stream))
            }
            Dest::Home => {
                let addr = self
                    .home_addr
                    .clone()
                    .ok_or_else(|| RelayError::NoRoute(host.to_string()))?;
                debug!(%host, %addr, "dialing home server");
                let stream = TcpStream::connect(&addr).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portside_endpoint::{Endpoint, NoSideDialer, SideInfo};
    use portside_proto::TunnelOptions;
    use portside_transport::{mem, Transport};
    use std::time::Duration;

    fn test_client() -> EndpointClient {
        let (caller, callee) = mem::pipe(32);
        let transport = Transport::new(caller.0, caller.1);
        // A live callee so shutdown negotiation completes.
        let (_endpoint, _serve) = Endpoint::serve(callee.0, callee.1, Arc::new(NoSideDialer));
        EndpointClient::new(
            transport,
            TunnelOptions::default(),
            SideInfo {
                addr: "wss://relay.test/side".to_string(),
                token: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_register_over_live_name_kicks_old_connection() {
        let registry = EndpointRegistry::new();

        let first = test_client();
        let first_closed = first.closed();
        registry.register("db", first);

        let second = test_client();
        let second_identity = second.identity().to_string();
        registry.register("db", second);

        // The superseded connection is shut down off the registration path.
        tokio::time::timeout(Duration::from_secs(5), first_closed.cancelled())
            .await
            .expect("kicked endpoint never shut down");

        // The successor owns the name.
        assert_eq!(
            registry.get("db").unwrap().identity(),
            second_identity.as_str()
        );
    }

    #[tokio::test]
    async fn test_stale_unregister_cannot_remove_successor() {
        let registry = EndpointRegistry::new();

        let first = test_client();
        let first_identity = first.identity().to_string();
        registry.register("db", first);

        let second = test_client();
        registry.register("db", second);

        // The kicked connection's deferred cleanup fires late.
        assert!(!registry.unregister("db", &first_identity));
        assert_eq!(registry.len(), 1, "successor was removed by a stale unregister");
    }

    #[tokio::test]
    async fn test_unregister_with_matching_identity() {
        let registry = EndpointRegistry::new();
        let client = test_client();
        let identity = client.identity().to_string();
        registry.register("db", client);

        assert!(registry.unregister("db", &identity));
        assert!(registry.get("db").is_none());
    }
}
