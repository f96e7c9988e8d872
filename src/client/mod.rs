//! Cloak client.
//!
//! The dual of the server handshake: seal the hidden credential into a
//! disguise first packet, read the server's answer and recover the session
//! key it chose.
//!
//! | Transport     | First packet                         | Answer                        |
//! |---------------|--------------------------------------|-------------------------------|
//! | `DirectTls`   | browser-shaped ClientHello           | ServerHello, CCS, app data    |
//! | `WsOverTls`   | WebSocket upgrade with `hidden` hdr  | first binary frame            |

pub mod config;

pub use config::{
    parse_config, ssv_to_json, AuthInfo, ConfigOverrides, LocalConnConfig, RawConfig,
    RemoteConnConfig, DEFAULT_STREAM_TIMEOUT,
};

use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::auth::{open_reply, seal_blob, unix_secs, ClientMetadata, Clock, SessionKey, SystemClock};
use crate::disguise::{tls, websocket, Browser, PreparedConn};
use crate::error::{Error, Result};

/// Limit on TCP connect plus the CDN TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the client reaches the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTransport {
    /// Straight to the server, looking like a browser's TLS handshake
    DirectTls { browser: Browser },
    /// Through a CDN that forwards WebSocket upgrades to the server
    WsOverTls { cdn_host: String, path: String },
}

impl ClientTransport {
    /// Whether session frames travel inside TLS-style records.
    pub fn has_record_layer(&self) -> bool {
        matches!(self, ClientTransport::DirectTls { .. })
    }

    /// Run the client side of the handshake on `stream`.
    ///
    /// Returns the prepared connection and the session key the server sent.
    pub async fn prepare<S>(
        &self,
        mut stream: S,
        auth: &AuthInfo,
        clock: &dyn Clock,
    ) -> Result<(PreparedConn<S>, SessionKey)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let metadata = ClientMetadata::new(
            auth.uid,
            auth.proxy_method.clone(),
            auth.encryption_method,
            unix_secs(clock.now()),
            auth.session_id,
            auth.unordered,
        )?;
        let (blob, shared_secret) = seal_blob(&metadata, &auth.server_public_key)?;

        match self {
            ClientTransport::DirectTls { browser } => {
                let hello = tls::build_client_hello(*browser, &auth.mock_domain, &blob);
                stream.write_all(&hello).await?;

                let reply = tls::read_server_reply(&mut stream).await?;
                let session_key = open_reply(&shared_secret, &reply)?;
                Ok((PreparedConn::Tls(stream), session_key))
            }
            ClientTransport::WsOverTls { cdn_host, path } => {
                let request = websocket::build_upgrade_request(cdn_host, path, &blob)?;

                let (ws, reply) = websocket::upgrade(stream, request).await?;
                let session_key = open_reply(&shared_secret, &reply)?;
                Ok((PreparedConn::WebSocket(ws), session_key))
            }
        }
    }
}

/// Any byte stream the client can run a handshake over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Plain TCP or TLS to a CDN, behind one type.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Dial the server and complete one handshake.
pub async fn connect(
    remote: &RemoteConnConfig,
    auth: &AuthInfo,
) -> Result<(PreparedConn<BoxedStream>, SessionKey)> {
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&remote.remote_addr))
        .await
        .map_err(|_| Error::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;
    tcp.set_nodelay(true)?;

    if let Some(idle) = remote.keep_alive {
        SockRef::from(&tcp).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }

    let stream: BoxedStream = match &remote.transport {
        ClientTransport::DirectTls { .. } => Box::new(tcp),
        ClientTransport::WsOverTls { cdn_host, .. } => Box::new(
            timeout(CONNECT_TIMEOUT, cdn_tls(cdn_host, tcp))
                .await
                .map_err(|_| Error::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??,
        ),
    };

    let prepared = remote.transport.prepare(stream, auth, &SystemClock).await?;
    tracing::debug!(
        "Handshake with {} complete (session {})",
        remote.remote_addr,
        auth.session_id
    );
    Ok(prepared)
}

/// Real TLS to the CDN edge, verified against the webpki roots.
async fn cdn_tls(host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    };
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::config(format!("invalid CDN host name {:?}", host)))?;

    let connector = TlsConnector::from(Arc::new(config));
    Ok(connector.connect(server_name, tcp).await?)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::auth::{authenticate, EncryptionMethod, ManualClock, TimestampWindow, UID_LEN};
    use crate::crypto::{PublicKey, StaticSecret};
    use crate::disguise::{Extracted, Transport};

    const NOW: u64 = 1_700_000_000;

    fn auth(server: &StaticSecret) -> AuthInfo {
        AuthInfo {
            uid: [3u8; UID_LEN],
            session_id: 42,
            proxy_method: "shadowsocks".into(),
            encryption_method: EncryptionMethod::AesGcm,
            unordered: false,
            server_public_key: PublicKey::from(server),
            mock_domain: "www.bing.com".into(),
        }
    }

    /// Minimal server: authenticate whatever arrives and answer with `key`.
    async fn answer<S>(mut stream: S, secret: StaticSecret, key: SessionKey) -> S
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 2048];
        let n = stream.read(&mut buf).await.unwrap();
        buf.truncate(n);

        let Extracted { blob, envelope } = Transport::detect(&buf).unwrap().extract(&buf).unwrap();
        let clock = ManualClock::at_unix(NOW);
        let authenticated = authenticate(&blob, &secret, &clock, &TimestampWindow::default()).unwrap();
        assert_eq!(authenticated.metadata.session_id, 42);

        let reply = crate::auth::seal_reply(&authenticated.shared_secret, &key).unwrap();
        match envelope.complete(stream, &reply).await.unwrap() {
            PreparedConn::Tls(s) => s,
            PreparedConn::WebSocket(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_direct_tls_prepare() {
        let secret = StaticSecret::random();
        let auth = auth(&secret);
        let key = SessionKey::random();
        let (client, server) = tokio::io::duplex(64 * 1024);

        let transport = ClientTransport::DirectTls {
            browser: Browser::Firefox,
        };
        let clock = ManualClock::at_unix(NOW);
        let (prepared, _) = tokio::join!(
            transport.prepare(client, &auth, &clock),
            answer(server, secret, key.clone())
        );

        let (conn, received) = prepared.unwrap();
        assert_eq!(received, key);
        assert_eq!(conn.transport(), Transport::Tls);
        assert!(transport.has_record_layer());
    }

    #[tokio::test]
    async fn test_wrong_server_key() {
        let secret = StaticSecret::random();
        let mut auth = auth(&secret);
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        // Reply sealed under an unrelated secret must not open.
        auth.server_public_key = PublicKey::from(&StaticSecret::random());
        let transport = ClientTransport::DirectTls {
            browser: Browser::Chrome,
        };
        let clock = ManualClock::at_unix(NOW);

        let server_task = async move {
            let mut buf = vec![0u8; 2048];
            let n = server.read(&mut buf).await.unwrap();
            let (_, ctx) = tls::extract(&buf[..n]).unwrap();
            let bogus = [0x5au8; crate::auth::REPLY_LEN];
            server
                .write_all(&tls::compose_server_reply(&ctx, &bogus))
                .await
                .unwrap();
            server
        };

        let (prepared, _server) = tokio::join!(transport.prepare(client, &auth, &clock), server_task);
        assert!(prepared.is_err());
    }

    #[test]
    fn test_transport_framing() {
        let ws = ClientTransport::WsOverTls {
            cdn_host: "cdn.example.com".into(),
            path: "/".into(),
        };
        assert!(!ws.has_record_layer());
    }
}
