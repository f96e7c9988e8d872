//! TLS 1.3 envelope.
//!
//! The client sends an ordinary-looking ClientHello whose SessionTicket
//! extension begins with the hidden blob. A Cloak server answers with
//!
//! ```text
//! Handshake(ServerHello)
//! ChangeCipherSpec
//! ApplicationData(reply[60])
//! ApplicationData(random[1024..=2048])   stands in for the encrypted certificate
//! ```
//!
//! after which both sides exchange ApplicationData records carrying session
//! traffic.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::{AuthBlob, AUTH_BLOB_LEN, REPLY_LEN};
use crate::crypto::{random_padding, SecureRandom};
use crate::disguise::browser::{grease_value, write_extension, Browser, ExtensionType};
use crate::error::{Error, Result};

/// TLS record types
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

/// TLS handshake types
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HandshakeType {
    ClientHello = 1,
    ServerHello = 2,
}

/// Largest record payload we emit.
pub const MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// Largest record payload we accept (fragment plus AEAD expansion allowance).
pub const MAX_RECORD_LEN: usize = MAX_FRAGMENT_LEN + 256;

/// Size of the SessionTicket a client sends; the blob fills the first 96 bytes.
pub const SESSION_TICKET_LEN: usize = 192;

const RECORD_HEADER_LEN: usize = 5;
const LEGACY_VERSION: u16 = 0x0303;
const TLS13: u16 = 0x0304;
const TLS13_CIPHER_SUITES: [u16; 3] = [0x1301, 0x1302, 0x1303];
const CLIENT_HELLO_MIN_LEN: usize = 512;

/// What the server needs from the ClientHello to answer it convincingly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerHelloContext {
    /// Legacy session id, echoed back
    pub session_id: Vec<u8>,
    /// Suite to claim in the ServerHello
    pub cipher_suite: u16,
}

/// Fields of a parsed ClientHello.
#[derive(Clone, Debug, Default)]
pub struct ClientHello {
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub server_name: Option<String>,
    pub session_ticket: Option<Vec<u8>>,
}

/// Bounds-checked reader over a handshake message.
struct Reader<'a> {
    data: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::malformed_tls(format!("{} truncated", self.what)));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse the ClientHello in the first record of `packet`.
///
/// Every length is checked against what actually arrived; any inconsistency
/// is a [`Error::MalformedEnvelope`].
pub fn parse_client_hello(packet: &[u8]) -> Result<ClientHello> {
    let mut record = Reader::new(packet, "record header");
    let content_type = record.u8()?;
    let version = record.u16()?;
    let record_len = record.u16()? as usize;

    if content_type != ContentType::Handshake as u8 {
        return Err(Error::malformed_tls("not a handshake record"));
    }
    if version >> 8 != 3 {
        return Err(Error::malformed_tls(format!("record version {:#06x}", version)));
    }

    record.what = "record";
    let fragment = record.take(record_len)?;

    let mut handshake = Reader::new(fragment, "handshake header");
    if handshake.u8()? != HandshakeType::ClientHello as u8 {
        return Err(Error::malformed_tls("not a ClientHello"));
    }
    let body_len = handshake.u24()?;
    handshake.what = "ClientHello";
    let mut body = Reader::new(handshake.take(body_len)?, "ClientHello");

    let _legacy_version = body.u16()?;
    let _random = body.take(32)?;

    let session_id_len = body.u8()? as usize;
    if session_id_len > 32 {
        return Err(Error::malformed_tls("session id longer than 32 bytes"));
    }
    let session_id = body.take(session_id_len)?.to_vec();

    let suites_len = body.u16()? as usize;
    if suites_len % 2 != 0 {
        return Err(Error::malformed_tls("odd cipher suite list length"));
    }
    let cipher_suites = body
        .take(suites_len)?
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let compression_len = body.u8()? as usize;
    body.take(compression_len)?;

    let mut hello = ClientHello {
        session_id,
        cipher_suites,
        ..Default::default()
    };

    // Extensions are optional in a bare ClientHello
    if body.is_empty() {
        return Ok(hello);
    }

    let extensions_len = body.u16()? as usize;
    let mut extensions = Reader::new(body.take(extensions_len)?, "extensions");
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let data = extensions.take(ext_len)?;

        if ext_type == ExtensionType::SessionTicket as u16 {
            hello.session_ticket = Some(data.to_vec());
        } else if ext_type == ExtensionType::ServerName as u16 {
            hello.server_name = parse_server_name(data);
        }
    }

    Ok(hello)
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    // list_len(2) name_type(1) name_len(2) name
    if data.len() < 5 || data[2] != 0 {
        return None;
    }
    let len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let name = data.get(5..5 + len)?;
    std::str::from_utf8(name).ok().map(str::to_owned)
}

/// Pull the blob out of a ClientHello.
///
/// A well-formed hello without a ticket large enough to hold a blob is
/// somebody else's TLS: [`Error::UnrecognizedProtocol`].
pub fn extract(packet: &[u8]) -> Result<(AuthBlob, ServerHelloContext)> {
    let hello = parse_client_hello(packet)?;

    let ticket = match hello.session_ticket {
        Some(ref t) if t.len() >= AUTH_BLOB_LEN => t,
        _ => return Err(Error::UnrecognizedProtocol),
    };
    let blob = AuthBlob::from_slice(&ticket[..AUTH_BLOB_LEN])?;

    let cipher_suite = hello
        .cipher_suites
        .iter()
        .copied()
        .find(|s| TLS13_CIPHER_SUITES.contains(s))
        .unwrap_or(TLS13_CIPHER_SUITES[0]);

    Ok((
        blob,
        ServerHelloContext {
            session_id: hello.session_id,
            cipher_suite,
        },
    ))
}

fn put_record(buf: &mut BytesMut, content_type: ContentType, payload: &[u8]) {
    buf.put_u8(content_type as u8);
    buf.put_u16(LEGACY_VERSION);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

fn server_hello(ctx: &ServerHelloContext) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(128);

    body.put_u16(LEGACY_VERSION);
    body.put_slice(&SecureRandom::bytes::<32>());
    body.put_u8(ctx.session_id.len() as u8);
    body.put_slice(&ctx.session_id);
    body.put_u16(ctx.cipher_suite);
    body.put_u8(0); // compression

    let mut extensions = BytesMut::with_capacity(48);
    write_extension(&mut extensions, ExtensionType::SupportedVersions as u16, &TLS13.to_be_bytes());

    let mut key_share = BytesMut::with_capacity(36);
    key_share.put_u16(0x001d); // X25519
    key_share.put_u16(32);
    key_share.put_slice(&SecureRandom::bytes::<32>());
    write_extension(&mut extensions, ExtensionType::KeyShare as u16, &key_share);

    body.put_u16(extensions.len() as u16);
    body.put_slice(&extensions);

    let mut msg = BytesMut::with_capacity(4 + body.len());
    msg.put_u8(HandshakeType::ServerHello as u8);
    msg.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.put_slice(&body);
    msg.to_vec()
}

/// Everything the server sends after accepting a ClientHello.
pub fn compose_server_reply(ctx: &ServerHelloContext, reply: &[u8; REPLY_LEN]) -> Vec<u8> {
    let filler_len = SecureRandom::range(1024, 2049);
    let mut buf = BytesMut::with_capacity(256 + filler_len);

    put_record(&mut buf, ContentType::Handshake, &server_hello(ctx));
    put_record(&mut buf, ContentType::ChangeCipherSpec, &[1]);
    put_record(&mut buf, ContentType::ApplicationData, reply);
    put_record(&mut buf, ContentType::ApplicationData, &random_padding(filler_len));

    buf.to_vec()
}

/// Build a browser-shaped ClientHello record carrying `blob`.
pub fn build_client_hello(browser: Browser, sni: &str, blob: &AuthBlob) -> Vec<u8> {
    let mut ticket = random_padding(SESSION_TICKET_LEN);
    ticket[..AUTH_BLOB_LEN].copy_from_slice(&blob.to_bytes());

    let mut body = BytesMut::with_capacity(CLIENT_HELLO_MIN_LEN);
    body.put_u16(LEGACY_VERSION);
    body.put_slice(&SecureRandom::bytes::<32>());
    body.put_u8(32);
    body.put_slice(&SecureRandom::bytes::<32>());

    let suites = browser.cipher_suites();
    let grease = browser.uses_grease();
    body.put_u16(((suites.len() + grease as usize) * 2) as u16);
    if grease {
        body.put_u16(grease_value());
    }
    for suite in suites {
        body.put_u16(*suite);
    }

    body.put_u8(1);
    body.put_u8(0); // null compression

    let mut extensions = BytesMut::from(&browser.extensions(sni, &ticket)[..]);
    // handshake header(4) + body + extensions length(2) + extensions
    let unpadded = 4 + body.len() + 2 + extensions.len();
    if unpadded + 4 < CLIENT_HELLO_MIN_LEN {
        let pad = CLIENT_HELLO_MIN_LEN - unpadded - 4;
        write_extension(&mut extensions, ExtensionType::Padding as u16, &vec![0u8; pad]);
    }

    body.put_u16(extensions.len() as u16);
    body.put_slice(&extensions);

    let mut msg = BytesMut::with_capacity(4 + body.len());
    msg.put_u8(HandshakeType::ClientHello as u8);
    msg.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.put_slice(&body);

    let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + msg.len());
    // Browsers send TLS 1.0 in the first record's version field
    record.put_u8(ContentType::Handshake as u8);
    record.put_u16(0x0301);
    record.put_u16(msg.len() as u16);
    record.put_slice(&msg);
    record.to_vec()
}

/// Read one record, returning its content type and payload.
///
/// Returns `Ok(None)` on a clean end of stream before a header byte arrives.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Network(e)),
    }

    let length = u16::from_be_bytes([header[3], header[4]]) as usize;
    if length > MAX_RECORD_LEN {
        return Err(Error::handshake(format!("record of {} bytes", length)));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header[0], payload)))
}

/// Write one record; payloads above [`MAX_FRAGMENT_LEN`] are rejected.
pub async fn write_record<W>(writer: &mut W, content_type: ContentType, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAGMENT_LEN {
        return Err(Error::Buffer {
            expected: MAX_FRAGMENT_LEN,
            actual: payload.len(),
        });
    }

    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len());
    put_record(&mut buf, content_type, payload);
    writer.write_all(&buf).await?;
    Ok(())
}

async fn expect_record<R>(reader: &mut R, content_type: ContentType) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match read_record(reader).await? {
        Some((t, payload)) if t == content_type as u8 => Ok(payload),
        Some((t, _)) => Err(Error::handshake(format!(
            "expected {:?} record, got type {}",
            content_type, t
        ))),
        None => Err(Error::handshake("connection closed during handshake")),
    }
}

/// Client side: consume the server's answer and return the sealed reply.
pub async fn read_server_reply<R>(reader: &mut R) -> Result<[u8; REPLY_LEN]>
where
    R: AsyncRead + Unpin,
{
    let hello = expect_record(reader, ContentType::Handshake).await?;
    if hello.first() != Some(&(HandshakeType::ServerHello as u8)) {
        return Err(Error::handshake("expected ServerHello"));
    }
    expect_record(reader, ContentType::ChangeCipherSpec).await?;

    let sealed = expect_record(reader, ContentType::ApplicationData).await?;
    let reply: [u8; REPLY_LEN] = sealed.as_slice().try_into().map_err(|_| Error::Buffer {
        expected: REPLY_LEN,
        actual: sealed.len(),
    })?;

    // Certificate stand-in
    expect_record(reader, ContentType::ApplicationData).await?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> AuthBlob {
        let mut bytes = [0u8; AUTH_BLOB_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthBlob::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_client_hello_shape() {
        for browser in [Browser::Chrome, Browser::Firefox] {
            let hello = build_client_hello(browser, "www.example.com", &blob());
            assert_eq!(hello[0], ContentType::Handshake as u8);
            assert_eq!(hello[5], HandshakeType::ClientHello as u8);
            assert_eq!(u16::from_be_bytes([hello[3], hello[4]]) as usize, hello.len() - 5);
            assert!(hello.len() - 5 >= CLIENT_HELLO_MIN_LEN);

            let parsed = parse_client_hello(&hello).unwrap();
            assert_eq!(parsed.server_name.as_deref(), Some("www.example.com"));
            assert_eq!(parsed.session_id.len(), 32);
            assert_eq!(parsed.session_ticket.map(|t| t.len()), Some(SESSION_TICKET_LEN));
        }
    }

    #[test]
    fn test_extract_blob() {
        let sent = blob();
        let hello = build_client_hello(Browser::Firefox, "example.org", &sent);
        let (received, ctx) = extract(&hello).unwrap();

        assert_eq!(received, sent);
        assert_eq!(ctx.cipher_suite, 0x1301);
        assert_eq!(ctx.session_id.len(), 32);
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let hello = build_client_hello(Browser::Chrome, "example.com", &blob());
        for cut in 1..hello.len() {
            let result = extract(&hello[..cut]);
            assert!(
                matches!(result, Err(Error::MalformedEnvelope { transport: "TLS", .. })),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_hello_without_ticket_is_unrecognised() {
        let mut body = BytesMut::new();
        body.put_u16(LEGACY_VERSION);
        body.put_slice(&[0u8; 32]);
        body.put_u8(0);
        body.put_u16(2);
        body.put_u16(0x1301);
        body.put_u8(1);
        body.put_u8(0);

        let mut msg = BytesMut::new();
        msg.put_u8(HandshakeType::ClientHello as u8);
        msg.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
        msg.put_slice(&body);

        let mut record = BytesMut::new();
        put_record(&mut record, ContentType::Handshake, &msg);

        assert!(parse_client_hello(&record).is_ok());
        assert!(matches!(extract(&record), Err(Error::UnrecognizedProtocol)));
    }

    #[test]
    fn test_inflated_lengths_are_malformed() {
        let mut hello = build_client_hello(Browser::Chrome, "example.com", &blob());
        // session id length beyond 32
        hello[5 + 4 + 2 + 32] = 0xff;
        assert!(matches!(extract(&hello), Err(Error::MalformedEnvelope { .. })));

        let mut hello = build_client_hello(Browser::Chrome, "example.com", &blob());
        hello[3] = 0xff;
        assert!(matches!(extract(&hello), Err(Error::MalformedEnvelope { .. })));
    }

    #[tokio::test]
    async fn test_server_reply_readable_by_client() {
        let ctx = ServerHelloContext {
            session_id: vec![7u8; 32],
            cipher_suite: 0x1302,
        };
        let reply = [0x42u8; REPLY_LEN];
        let bytes = compose_server_reply(&ctx, &reply);

        // ServerHello echoes the session id and chosen suite
        let hello = &bytes[5..];
        assert_eq!(hello[0], HandshakeType::ServerHello as u8);
        assert_eq!(hello[4 + 2 + 32], 32);
        assert_eq!(&hello[4 + 2 + 32 + 1..4 + 2 + 32 + 33], &[7u8; 32][..]);

        let mut reader = &bytes[..];
        let received = read_server_reply(&mut reader).await.unwrap();
        assert_eq!(received, reply);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_record_io() {
        let mut buf = Vec::new();
        write_record(&mut buf, ContentType::ApplicationData, b"hello").await.unwrap();
        assert!(write_record(&mut buf, ContentType::ApplicationData, &vec![0u8; MAX_FRAGMENT_LEN + 1])
            .await
            .is_err());

        let mut reader = &buf[..];
        let (t, payload) = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(t, ContentType::ApplicationData as u8);
        assert_eq!(payload, b"hello");
        assert!(read_record(&mut reader).await.unwrap().is_none());
    }
}
