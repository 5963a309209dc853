//! Front-to-back relay flows over real TCP listeners: sniffed SNI decides
//! the backend, and the backend sees the untouched TLS bytes from the start.

use portside_endpoint::{Endpoint, EndpointClient, NoSideDialer, SideInfo};
use portside_proto::TunnelOptions;
use portside_relay::{Dest, EndpointRegistry, Proxy, RegistryDialer, RejectPolicy, RouteTable};
use portside_transport::{mem, Transport};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal well-formed ClientHello record carrying one SNI entry.
fn client_hello(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();
    let mut ext = Vec::new();
    ext.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext.push(0x00); // host_name
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0u8; 32]);
    hello.push(0x00);
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    hello.extend_from_slice(&ext);

    let mut handshake = vec![0x01];
    let len = hello.len();
    handshake.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x03];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// TCP backend that checks it received the replayed hello verbatim, then
/// answers with a banner.
async fn banner_backend(expected_hello: Vec<u8>, banner: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut got = vec![0u8; expected_hello.len()];
        socket.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected_hello, "backend saw a modified hello");
        socket.write_all(banner.as_bytes()).await.unwrap();
    });
    addr
}

async fn start_proxy(routes: Arc<RouteTable>, registry: Arc<EndpointRegistry>) -> String {
    let dialer = Arc::new(RegistryDialer::new(registry, routes, None));
    let proxy = Proxy::new(dialer, RejectPolicy::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { proxy.run(listener).await });
    addr
}

#[tokio::test]
async fn test_sni_routes_to_the_matching_backend() {
    let hello1 = client_hello("site1.example.test");
    let hello2 = client_hello("site2.example.test");
    let backend1 = banner_backend(hello1.clone(), "greetings from site1").await;
    let backend2 = banner_backend(hello2.clone(), "greetings from site2").await;

    let routes = Arc::new(RouteTable::new());
    routes.insert("site1.example.test", Dest::Tcp(backend1));
    routes.insert("site2.example.test", Dest::Tcp(backend2));
    let proxy_addr = start_proxy(routes, Arc::new(EndpointRegistry::new())).await;

    for (hello, want) in [
        (hello2, "greetings from site2"),
        (hello1, "greetings from site1"),
    ] {
        let mut conn = TcpStream::connect(&proxy_addr).await.unwrap();
        conn.write_all(&hello).await.unwrap();
        let mut banner = String::new();
        conn.read_to_string(&mut banner).await.unwrap();
        assert_eq!(banner, want);
    }
}

#[tokio::test]
async fn test_unrouted_and_rejected_names_get_no_backend() {
    let routes = Arc::new(RouteTable::new());
    routes.insert("known.example.test", Dest::Tcp("127.0.0.1:1".to_string()));
    let proxy_addr = start_proxy(routes, Arc::new(EndpointRegistry::new())).await;

    // No route registered for this name.
    let mut conn = TcpStream::connect(&proxy_addr).await.unwrap();
    conn.write_all(&client_hello("unknown.example.test"))
        .await
        .unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty(), "unrouted connection produced data");

    // IP-literal names are refused before any dial.
    let mut conn = TcpStream::connect(&proxy_addr).await.unwrap();
    conn.write_all(&client_hello("192.0.2.7")).await.unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty(), "rejected connection produced data");
}

#[tokio::test]
async fn test_sni_routes_through_a_registered_endpoint() {
    // Endpoint backend over an in-memory frame pipe, echoing every stream.
    let (caller, callee) = mem::pipe(32);
    let transport = Transport::new(caller.0, caller.1);
    let (mut endpoint, _serve) = Endpoint::serve(callee.0, callee.1, Arc::new(NoSideDialer));
    tokio::spawn(async move {
        while let Ok(mut accepted) = endpoint.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match accepted.io.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if accepted.io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = accepted.io.shutdown().await;
            });
        }
    });

    let client = EndpointClient::new(
        transport,
        TunnelOptions::default(),
        SideInfo {
            addr: "wss://relay.test/side".to_string(),
            token: String::new(),
        },
    );
    let registry = Arc::new(EndpointRegistry::new());
    registry.register("tun", client);

    let routes = Arc::new(RouteTable::new());
    routes.insert("tun.example.test", Dest::Endpoint("tun".to_string()));
    let proxy_addr = start_proxy(routes, registry).await;

    let hello = client_hello("tun.example.test");
    let mut conn = TcpStream::connect(&proxy_addr).await.unwrap();
    conn.write_all(&hello).await.unwrap();

    // The echo backend reflects the replayed hello first, then our payload.
    let mut echoed = vec![0u8; hello.len()];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, hello);

    conn.write_all(b"application bytes").await.unwrap();
    let mut payload = vec![0u8; 17];
    conn.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"application bytes");
}
