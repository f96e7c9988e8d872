//! End-to-end handshake tests: client and server halves against each other.

#![cfg(feature = "server")]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use cloak::auth::{EncryptionMethod, ManualClock, SessionKey, SystemClock, TimestampWindow};
use cloak::client::{AuthInfo, ClientTransport};
use cloak::crypto::{PublicKey, StaticSecret};
use cloak::disguise::{Browser, PreparedConn, Transport};
use cloak::server::{auth_first_packet, ChannelHandoff, Handoff, Server, ServerConfig, State};
use cloak::Error;

const NOW: u64 = 1_700_000_000;
const UID: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
];

fn auth_info(server_public_key: PublicKey, uid: [u8; 16]) -> AuthInfo {
    AuthInfo {
        uid,
        session_id: 0x0c1a_0001,
        proxy_method: "shadowsocks".into(),
        encryption_method: EncryptionMethod::ChaCha20Poly1305,
        unordered: false,
        server_public_key,
        mock_domain: "www.bing.com".into(),
    }
}

fn state(secret: StaticSecret, clock: Arc<ManualClock>) -> State {
    let mut book = HashMap::new();
    book.insert("shadowsocks".to_string(), "127.0.0.1:8388".to_string());
    State::new(secret, book, vec![UID], clock, TimestampWindow::default())
}

/// Read until the bytes form a complete disguise first packet.
async fn read_first_packet<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut packet = Vec::new();
    let mut buf = [0u8; 1500];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before its first packet was complete");
        packet.extend_from_slice(&buf[..n]);

        if Transport::detect(&packet)
            .and_then(|t| t.extract(&packet))
            .is_ok()
        {
            return packet;
        }
    }
}

/// Server half over an in-memory stream: authenticate, then finish with `key`.
async fn serve_one<S>(mut stream: S, state: &State, key: &SessionKey) -> PreparedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = read_first_packet(&mut stream).await;
    let accepted = auth_first_packet(&packet, state).unwrap();
    assert!(state.is_authorised(&accepted.metadata.uid));
    assert_eq!(accepted.metadata.session_id, 0x0c1a_0001);
    assert_eq!(
        accepted.metadata.encryption(),
        Some(EncryptionMethod::ChaCha20Poly1305)
    );

    accepted.finisher.finish(stream, key).await.unwrap()
}

async fn exchange_units<S>(client: &mut PreparedConn<S>, server: &mut PreparedConn<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client.write_unit(b"upstream").await.unwrap();
    assert_eq!(server.read_unit().await.unwrap().unwrap(), b"upstream");

    server.write_unit(b"downstream").await.unwrap();
    assert_eq!(client.read_unit().await.unwrap().unwrap(), b"downstream");
}

#[tokio::test]
async fn test_direct_tls_end_to_end() {
    let secret = StaticSecret::random();
    let auth = auth_info(PublicKey::from(&secret), UID);
    let clock = Arc::new(ManualClock::at_unix(NOW));
    let state = state(secret, Arc::clone(&clock));
    let key = SessionKey::random();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let transport = ClientTransport::DirectTls {
        browser: Browser::Chrome,
    };

    let (client, mut server) = tokio::join!(
        transport.prepare(client_io, &auth, clock.as_ref()),
        serve_one(server_io, &state, &key)
    );
    let (mut client, client_key) = client.unwrap();

    assert_eq!(client_key, key);
    assert_eq!(client.transport(), Transport::Tls);
    assert_eq!(server.transport(), Transport::Tls);

    exchange_units(&mut client, &mut server).await;
}

#[tokio::test]
async fn test_websocket_end_to_end() {
    let secret = StaticSecret::random();
    let auth = auth_info(PublicKey::from(&secret), UID);
    let clock = Arc::new(ManualClock::at_unix(NOW));
    let state = state(secret, Arc::clone(&clock));
    let key = SessionKey::random();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let transport = ClientTransport::WsOverTls {
        cdn_host: "cdn.example.com".into(),
        path: "/ws".into(),
    };

    let (client, mut server) = tokio::join!(
        transport.prepare(client_io, &auth, clock.as_ref()),
        serve_one(server_io, &state, &key)
    );
    let (mut client, client_key) = client.unwrap();

    assert_eq!(client_key, key);
    assert_eq!(client.transport(), Transport::WebSocket);
    assert_eq!(server.transport(), Transport::WebSocket);

    exchange_units(&mut client, &mut server).await;
}

#[tokio::test]
async fn test_clock_skew_rejected() {
    let secret = StaticSecret::random();
    let auth = auth_info(PublicKey::from(&secret), UID);
    let server_clock = Arc::new(ManualClock::at_unix(NOW));
    let state = state(secret, server_clock);

    // Client clock four hours ahead of the server.
    let client_clock = ManualClock::at_unix(NOW + 4 * 3600);
    let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
    let transport = ClientTransport::DirectTls {
        browser: Browser::Firefox,
    };

    let client = tokio::spawn(async move {
        let _ = transport.prepare(client_io, &auth, &client_clock).await;
    });

    let packet = read_first_packet(&mut server_io).await;
    assert!(matches!(
        auth_first_packet(&packet, &state),
        Err(Error::TimestampOutOfWindow { .. })
    ));

    drop(server_io);
    client.await.unwrap();
}

async fn spawn_server(config: ServerConfig) -> (Arc<Server>, SocketAddr, mpsc::Receiver<Handoff>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (handoff, rx) = ChannelHandoff::channel(8);
    let server = Arc::new(Server::new(config, Arc::new(handoff)));
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    (server, addr, rx)
}

#[tokio::test]
async fn test_server_hands_off_authenticated_connection() {
    let mut config = ServerConfig::new_random("127.0.0.1:0", None);
    config.add_proxy("shadowsocks", "127.0.0.1:8388");
    config.add_uid(UID);
    let auth = auth_info(config.public_key(), UID);

    let (server, addr, mut sessions) = spawn_server(config).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let transport = ClientTransport::DirectTls {
        browser: Browser::Chrome,
    };
    let (mut client, client_key) = transport.prepare(stream, &auth, &SystemClock).await.unwrap();

    let mut handoff = timeout(Duration::from_secs(5), sessions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handoff.session_key, client_key);
    assert_eq!(handoff.metadata.uid, UID);
    assert!(handoff.record_framing());
    assert!(handoff.payload_cipher().unwrap().is_some());

    client.write_unit(b"hello").await.unwrap();
    assert_eq!(handoff.conn.read_unit().await.unwrap().unwrap(), b"hello");

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.accepted_handshakes, 1);
    assert_eq!(snapshot.total_rejections(), 0);
}

#[tokio::test]
async fn test_server_redirects_foreign_traffic() {
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let request = b"GET / HTTP/1.1\r\nHost: www.bing.com\r\n\r\n";

    let decoy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let decoy_addr = decoy.local_addr().unwrap();
    let decoy_task = tokio::spawn(async move {
        let (mut stream, _) = decoy.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(RESPONSE).await.unwrap();
        stream.shutdown().await.unwrap();
        buf.truncate(n);
        buf
    });

    let mut config = ServerConfig::new_random("127.0.0.1:0", Some(decoy_addr.to_string()));
    config.add_proxy("shadowsocks", "127.0.0.1:8388");
    config.add_uid(UID);
    let (server, addr, _sessions) = spawn_server(config).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response, RESPONSE);
    assert_eq!(decoy_task.await.unwrap(), request);

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.redirected_connections, 1);
    assert_eq!(snapshot.total_rejections(), 1);
}

#[tokio::test]
async fn test_server_drops_unauthorised_uid() {
    let mut config = ServerConfig::new_random("127.0.0.1:0", None);
    config.add_proxy("shadowsocks", "127.0.0.1:8388");
    config.add_uid(UID);
    let auth = auth_info(config.public_key(), [0x42; 16]);

    let (server, addr, _sessions) = spawn_server(config).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let transport = ClientTransport::DirectTls {
        browser: Browser::Chrome,
    };

    // The server closes without a reply, so the client never sees a ServerHello.
    let result = timeout(
        Duration::from_secs(5),
        transport.prepare(stream, &auth, &SystemClock),
    )
    .await
    .unwrap();
    assert!(result.is_err());

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.accepted_handshakes, 0);
    assert_eq!(snapshot.dropped_connections, 1);
}
