//! WebSocket envelope.
//!
//! The client's upgrade request carries the blob, base64 encoded, in a
//! `hidden` header. The server answers `101 Switching Protocols` and sends the
//! sealed reply as the first binary frame; everything after that is ordinary
//! binary WebSocket traffic, which lets the connection ride through CDNs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthBlob, AUTH_BLOB_LEN, REPLY_LEN};
use crate::error::{Error, Result};

/// Header carrying the blob.
pub const HIDDEN_HEADER: &str = "hidden";

const MAX_HEADERS: usize = 32;

/// What the server needs to answer an upgrade request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeContext {
    /// `Sec-WebSocket-Accept` value for the client's key
    pub accept_key: String,
}

fn header<'h>(headers: &'h [httparse::Header<'_>], name: &str) -> Option<&'h [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

/// Pull the blob out of an HTTP upgrade request.
pub fn extract(packet: &[u8]) -> Result<(AuthBlob, UpgradeContext)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(packet) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::malformed_ws("incomplete request")),
        Err(e) => return Err(Error::malformed_ws(e.to_string())),
    }

    // Ordinary web requests are foreign traffic, not broken envelopes.
    if req.method != Some("GET") {
        return Err(Error::UnrecognizedProtocol);
    }
    let hidden = header(req.headers, HIDDEN_HEADER).ok_or(Error::UnrecognizedProtocol)?;
    let key = header(req.headers, "sec-websocket-key")
        .ok_or_else(|| Error::malformed_ws("missing Sec-WebSocket-Key"))?;

    let decoded = BASE64
        .decode(hidden)
        .map_err(|e| Error::malformed_ws(format!("hidden header: {}", e)))?;
    if decoded.len() != AUTH_BLOB_LEN {
        return Err(Error::malformed_ws(format!(
            "hidden header decodes to {} bytes",
            decoded.len()
        )));
    }
    let blob = AuthBlob::from_slice(&decoded)?;

    Ok((
        blob,
        UpgradeContext {
            accept_key: derive_accept_key(key),
        },
    ))
}

/// The `101 Switching Protocols` response for `ctx`.
pub fn upgrade_response(ctx: &UpgradeContext) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        ctx.accept_key
    )
}

/// Server side: finish the upgrade and send `reply` as the first frame.
pub async fn complete<S>(
    mut stream: S,
    ctx: &UpgradeContext,
    reply: &[u8; REPLY_LEN],
) -> Result<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(upgrade_response(ctx).as_bytes()).await {
        let _ = stream.shutdown().await;
        return Err(e.into());
    }

    let mut ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    if let Err(e) = ws.send(Message::Binary(reply.to_vec())).await {
        let _ = ws.get_mut().shutdown().await;
        return Err(e.into());
    }
    Ok(ws)
}

/// Client side: an upgrade request for `ws://host/path` carrying `blob`.
pub fn build_upgrade_request(host: &str, path: &str, blob: &AuthBlob) -> Result<Request<()>> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    Request::builder()
        .method("GET")
        .uri(format!("ws://{}{}", host, path))
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header(HIDDEN_HEADER, BASE64.encode(blob.to_bytes()))
        .body(())
        .map_err(|e| Error::config(format!("invalid WebSocket request: {}", e)))
}

/// Client side: perform the upgrade on `stream` and read the sealed reply.
pub async fn upgrade<S>(stream: S, request: Request<()>) -> Result<(WebSocketStream<S>, [u8; REPLY_LEN])>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws, _response) = tokio_tungstenite::client_async(request, stream).await?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let reply: [u8; REPLY_LEN] =
                    data.as_slice().try_into().map_err(|_| Error::Buffer {
                        expected: REPLY_LEN,
                        actual: data.len(),
                    })?;
                return Ok((ws, reply));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(Error::handshake(format!("unexpected first message: {:?}", other)))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(Error::handshake("connection closed during handshake")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes(hidden: Option<&str>) -> Vec<u8> {
        let mut req = String::from(
            "GET /ws HTTP/1.1\r\n\
             Host: cdn.example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n",
        );
        if let Some(h) = hidden {
            req.push_str(&format!("hidden: {}\r\n", h));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    #[test]
    fn test_extract_blob_and_accept_key() {
        let raw = [0x33u8; AUTH_BLOB_LEN];
        let packet = request_bytes(Some(&BASE64.encode(raw)));

        let (blob, ctx) = extract(&packet).unwrap();
        assert_eq!(blob.to_bytes(), raw);
        // RFC 6455 section 1.3 sample
        assert_eq!(ctx.accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(upgrade_response(&ctx).starts_with("HTTP/1.1 101 "));
    }

    #[test]
    fn test_missing_hidden_is_unrecognised() {
        let packet = request_bytes(None);
        assert!(matches!(extract(&packet), Err(Error::UnrecognizedProtocol)));
    }

    #[test]
    fn test_plain_page_request_is_unrecognised() {
        let packet = b"GET /index.html HTTP/1.1\r\n\
            Host: www.example.com\r\n\
            User-Agent: curl/8.0\r\n\
            Accept: */*\r\n\r\n";
        assert!(matches!(extract(packet), Err(Error::UnrecognizedProtocol)));
    }

    #[test]
    fn test_hidden_without_upgrade_key_is_malformed() {
        let hidden = BASE64.encode([0x33u8; AUTH_BLOB_LEN]);
        let packet = format!(
            "GET /ws HTTP/1.1\r\nHost: cdn.example.com\r\nhidden: {}\r\n\r\n",
            hidden
        );
        assert!(matches!(
            extract(packet.as_bytes()),
            Err(Error::MalformedEnvelope { transport: "WebSocket", .. })
        ));
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let packet = request_bytes(Some("!!!not-base64!!!"));
        assert!(matches!(
            extract(&packet),
            Err(Error::MalformedEnvelope { transport: "WebSocket", .. })
        ));
    }

    #[test]
    fn test_short_blob_is_malformed() {
        let packet = request_bytes(Some(&BASE64.encode([1u8; 40])));
        assert!(matches!(extract(&packet), Err(Error::MalformedEnvelope { .. })));
    }

    #[test]
    fn test_broken_http_is_malformed() {
        assert!(matches!(
            extract(b"GET /ws HTTP/1.1\r\nHost: x\r\n"),
            Err(Error::MalformedEnvelope { .. })
        ));
        assert!(matches!(
            extract(b"GARBAGE\x00\x01\r\n\r\n"),
            Err(Error::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn test_request_carries_hidden_header() {
        let blob = AuthBlob::from_slice(&[9u8; AUTH_BLOB_LEN]).unwrap();
        let request = build_upgrade_request("cdn.example.com", "ws", &blob).unwrap();

        assert_eq!(request.uri().path(), "/ws");
        let hidden = request.headers().get(HIDDEN_HEADER).unwrap();
        assert_eq!(BASE64.decode(hidden.as_bytes()).unwrap(), vec![9u8; AUTH_BLOB_LEN]);
    }

    #[tokio::test]
    async fn test_upgrade_delivers_reply() {
        let (client_io, mut server_io) = tokio::io::duplex(8192);
        let blob = AuthBlob::from_slice(&[4u8; AUTH_BLOB_LEN]).unwrap();
        let request = build_upgrade_request("cdn.example.com", "/", &blob).unwrap();
        let reply = [0x5au8; REPLY_LEN];

        let server = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; 2048];
            let n = server_io.read(&mut buf).await.unwrap();
            let (received, ctx) = extract(&buf[..n]).unwrap();
            assert_eq!(received.to_bytes(), [4u8; AUTH_BLOB_LEN]);
            complete(server_io, &ctx, &reply).await.unwrap()
        });

        let (_ws, received) = upgrade(client_io, request).await.unwrap();
        assert_eq!(received, reply);
        server.await.unwrap();
    }
}
