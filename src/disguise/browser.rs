//! Browser ClientHello fingerprints.
//!
//! Cipher suite lists and extension orders follow what current Chrome and
//! Firefox releases put on the wire. Values that vary per connection in real
//! browsers (GREASE, key shares) are randomised here too.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// TLS extension types used in the fingerprints.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExtensionType {
    ServerName = 0,
    StatusRequest = 5,
    SupportedGroups = 10,
    EcPointFormats = 11,
    SignatureAlgorithms = 13,
    ApplicationLayerProtocolNegotiation = 16,
    SignedCertificateTimestamp = 18,
    Padding = 21,
    ExtendedMasterSecret = 23,
    CompressCertificate = 27,
    RecordSizeLimit = 28,
    SessionTicket = 35,
    SupportedVersions = 43,
    PskKeyExchangeModes = 45,
    KeyShare = 51,
    RenegotiationInfo = 0xff01,
}

const X25519: u16 = 0x001d;

const CHROME_CIPHER_SUITES: &[u16] = &[
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
    0x009c, 0x009d, 0x002f, 0x0035,
];

const FIREFOX_CIPHER_SUITES: &[u16] = &[
    0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009,
    0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
];

const CHROME_GROUPS: &[u16] = &[X25519, 0x0017, 0x0018];

const FIREFOX_GROUPS: &[u16] = &[X25519, 0x0017, 0x0018, 0x0019, 0x0100, 0x0101];

const CHROME_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
];

const FIREFOX_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203, 0x0201,
];

/// Browser whose ClientHello the client imitates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chrome,
    Firefox,
}

impl Browser {
    /// Offered cipher suites, in order, excluding GREASE.
    pub fn cipher_suites(self) -> &'static [u16] {
        match self {
            Browser::Chrome => CHROME_CIPHER_SUITES,
            Browser::Firefox => FIREFOX_CIPHER_SUITES,
        }
    }

    /// Whether the browser sprinkles GREASE values through its hello.
    pub fn uses_grease(self) -> bool {
        matches!(self, Browser::Chrome)
    }

    /// Serialised extension block (without the outer length and padding).
    pub(crate) fn extensions(self, sni: &str, ticket: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        let grease = grease_value();

        match self {
            Browser::Chrome => {
                write_extension(&mut buf, grease, &[]);
                write_server_name(&mut buf, sni);
                write_extension(&mut buf, ExtensionType::ExtendedMasterSecret as u16, &[]);
                write_extension(&mut buf, ExtensionType::RenegotiationInfo as u16, &[0]);
                write_u16_list(&mut buf, ExtensionType::SupportedGroups, &with_grease(grease, CHROME_GROUPS));
                write_extension(&mut buf, ExtensionType::EcPointFormats as u16, &[1, 0]);
                write_extension(&mut buf, ExtensionType::SessionTicket as u16, ticket);
                write_alpn(&mut buf, &["h2", "http/1.1"]);
                write_extension(&mut buf, ExtensionType::StatusRequest as u16, &[1, 0, 0, 0, 0]);
                write_u16_list(&mut buf, ExtensionType::SignatureAlgorithms, CHROME_SIGNATURE_ALGORITHMS);
                write_extension(&mut buf, ExtensionType::SignedCertificateTimestamp as u16, &[]);
                write_key_share(&mut buf, Some(grease));
                write_extension(&mut buf, ExtensionType::PskKeyExchangeModes as u16, &[1, 1]);
                write_supported_versions(&mut buf, &[grease, 0x0304, 0x0303]);
                write_extension(&mut buf, ExtensionType::CompressCertificate as u16, &[2, 0, 2]);
                // A second, distinct GREASE extension closes the list
                write_extension(&mut buf, grease ^ 0x1010, &[0]);
            }
            Browser::Firefox => {
                write_server_name(&mut buf, sni);
                write_extension(&mut buf, ExtensionType::ExtendedMasterSecret as u16, &[]);
                write_extension(&mut buf, ExtensionType::RenegotiationInfo as u16, &[0]);
                write_u16_list(&mut buf, ExtensionType::SupportedGroups, FIREFOX_GROUPS);
                write_extension(&mut buf, ExtensionType::EcPointFormats as u16, &[1, 0]);
                write_extension(&mut buf, ExtensionType::SessionTicket as u16, ticket);
                write_alpn(&mut buf, &["h2", "http/1.1"]);
                write_extension(&mut buf, ExtensionType::StatusRequest as u16, &[1, 0, 0, 0, 0]);
                write_key_share(&mut buf, None);
                write_supported_versions(&mut buf, &[0x0304, 0x0303]);
                write_u16_list(&mut buf, ExtensionType::SignatureAlgorithms, FIREFOX_SIGNATURE_ALGORITHMS);
                write_extension(&mut buf, ExtensionType::PskKeyExchangeModes as u16, &[1, 1]);
                write_extension(&mut buf, ExtensionType::RecordSizeLimit as u16, &[0x40, 0x01]);
            }
        }

        buf.to_vec()
    }
}

impl FromStr for Browser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Ok(Browser::Chrome),
            "firefox" => Ok(Browser::Firefox),
            _ => Err(Error::config(format!("unknown browser {}", s))),
        }
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Browser::Chrome => f.write_str("chrome"),
            Browser::Firefox => f.write_str("firefox"),
        }
    }
}

/// A random GREASE value (RFC 8701): `0x?a?a` with both bytes equal.
pub(crate) fn grease_value() -> u16 {
    let b = ((SecureRandom::u32() as u8) & 0xf0) | 0x0a;
    u16::from_be_bytes([b, b])
}

pub(crate) fn write_extension(buf: &mut BytesMut, ext_type: u16, data: &[u8]) {
    buf.put_u16(ext_type);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn with_grease(grease: u16, values: &[u16]) -> Vec<u16> {
    let mut out = Vec::with_capacity(values.len() + 1);
    out.push(grease);
    out.extend_from_slice(values);
    out
}

fn write_server_name(buf: &mut BytesMut, sni: &str) {
    let name = sni.as_bytes();

    buf.put_u16(ExtensionType::ServerName as u16);
    buf.put_u16((5 + name.len()) as u16);
    buf.put_u16((3 + name.len()) as u16);
    buf.put_u8(0); // host_name
    buf.put_u16(name.len() as u16);
    buf.put_slice(name);
}

fn write_u16_list(buf: &mut BytesMut, ext_type: ExtensionType, values: &[u16]) {
    buf.put_u16(ext_type as u16);
    buf.put_u16((2 + values.len() * 2) as u16);
    buf.put_u16((values.len() * 2) as u16);
    for v in values {
        buf.put_u16(*v);
    }
}

fn write_alpn(buf: &mut BytesMut, protocols: &[&str]) {
    let mut list = Vec::new();
    for proto in protocols {
        list.push(proto.len() as u8);
        list.extend_from_slice(proto.as_bytes());
    }

    buf.put_u16(ExtensionType::ApplicationLayerProtocolNegotiation as u16);
    buf.put_u16((2 + list.len()) as u16);
    buf.put_u16(list.len() as u16);
    buf.put_slice(&list);
}

fn write_supported_versions(buf: &mut BytesMut, versions: &[u16]) {
    buf.put_u16(ExtensionType::SupportedVersions as u16);
    buf.put_u16((1 + versions.len() * 2) as u16);
    buf.put_u8((versions.len() * 2) as u8);
    for v in versions {
        buf.put_u16(*v);
    }
}

fn write_key_share(buf: &mut BytesMut, grease: Option<u16>) {
    // The key is never used: the real key agreement rides in the ticket
    let key: [u8; 32] = SecureRandom::bytes();

    let mut entries = BytesMut::with_capacity(48);
    if let Some(g) = grease {
        entries.put_u16(g);
        entries.put_u16(1);
        entries.put_u8(0);
    }
    entries.put_u16(X25519);
    entries.put_u16(key.len() as u16);
    entries.put_slice(&key);

    buf.put_u16(ExtensionType::KeyShare as u16);
    buf.put_u16((2 + entries.len()) as u16);
    buf.put_u16(entries.len() as u16);
    buf.put_slice(&entries);
}
