//! Client metadata carried inside the hidden blob.
//!
//! Plaintext layout (42 bytes, integers big-endian):
//!
//! ```text
//! [0..16]   UID                opaque, compared byte-for-byte
//! [16..28]  proxy method       NUL-padded, not necessarily NUL-terminated
//! [28]      encryption method  session-layer cipher selector
//! [29..37]  timestamp          UNIX seconds, i64
//! [37..41]  session id         u32
//! [41]      flags              bit 0 = unordered (UDP) mode
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Length of the client identifier.
pub const UID_LEN: usize = 16;

/// Width of the proxy method field.
pub const PROXY_METHOD_LEN: usize = 12;

/// Length of the decrypted metadata.
pub const METADATA_LEN: usize = 42;

/// Flag bit for unordered (UDP) sessions.
pub const UNORDERED_FLAG: u8 = 0x01;

/// Session-layer payload cipher, chosen by the client.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncryptionMethod {
    /// No payload encryption
    Plain = 0x00,
    /// AES-256-GCM
    AesGcm = 0x01,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305 = 0x02,
}

impl EncryptionMethod {
    /// Decode a wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(EncryptionMethod::Plain),
            0x01 => Some(EncryptionMethod::AesGcm),
            0x02 => Some(EncryptionMethod::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl FromStr for EncryptionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(EncryptionMethod::Plain),
            "aes-gcm" => Ok(EncryptionMethod::AesGcm),
            "chacha20-poly1305" => Ok(EncryptionMethod::ChaCha20Poly1305),
            _ => Err(Error::config(format!("unknown encryption method {}", s))),
        }
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionMethod::Plain => "plain",
            EncryptionMethod::AesGcm => "aes-gcm",
            EncryptionMethod::ChaCha20Poly1305 => "chacha20-poly1305",
        };
        f.write_str(name)
    }
}

/// Identity and session parameters recovered from an authenticated blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMetadata {
    /// Opaque client identifier
    pub uid: [u8; UID_LEN],
    /// Proxy method name, trailing NULs removed
    pub proxy_method: String,
    /// Raw encryption method byte
    pub encryption_method: u8,
    /// Client clock at blob creation, UNIX seconds
    pub timestamp: i64,
    /// Session identifier chosen by the client
    pub session_id: u32,
    /// Raw flag byte
    pub flags: u8,
}

impl ClientMetadata {
    /// Build metadata for sending, validating the proxy method width.
    pub fn new(
        uid: [u8; UID_LEN],
        proxy_method: impl Into<String>,
        encryption_method: EncryptionMethod,
        timestamp: i64,
        session_id: u32,
        unordered: bool,
    ) -> Result<Self> {
        let proxy_method = proxy_method.into();
        if proxy_method.len() > PROXY_METHOD_LEN {
            return Err(Error::config(format!(
                "proxy method {:?} longer than {} bytes",
                proxy_method, PROXY_METHOD_LEN
            )));
        }

        Ok(Self {
            uid,
            proxy_method,
            encryption_method: encryption_method.as_byte(),
            timestamp,
            session_id,
            flags: if unordered { UNORDERED_FLAG } else { 0 },
        })
    }

    /// Decode the 42-byte plaintext.
    pub fn from_plaintext(plaintext: &[u8; METADATA_LEN]) -> Self {
        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&plaintext[0..16]);

        let method_field = &plaintext[16..28];
        let trimmed_len = method_field
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        let proxy_method = String::from_utf8_lossy(&method_field[..trimmed_len]).into_owned();

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&plaintext[29..37]);
        let mut session_id = [0u8; 4];
        session_id.copy_from_slice(&plaintext[37..41]);

        Self {
            uid,
            proxy_method,
            encryption_method: plaintext[28],
            timestamp: i64::from_be_bytes(timestamp),
            session_id: u32::from_be_bytes(session_id),
            flags: plaintext[41],
        }
    }

    /// Encode to the 42-byte plaintext.
    ///
    /// Proxy method names longer than the field are cut at 12 bytes.
    pub fn to_plaintext(&self) -> [u8; METADATA_LEN] {
        let mut plaintext = [0u8; METADATA_LEN];
        plaintext[0..16].copy_from_slice(&self.uid);

        let method = self.proxy_method.as_bytes();
        let n = method.len().min(PROXY_METHOD_LEN);
        plaintext[16..16 + n].copy_from_slice(&method[..n]);

        plaintext[28] = self.encryption_method;
        plaintext[29..37].copy_from_slice(&self.timestamp.to_be_bytes());
        plaintext[37..41].copy_from_slice(&self.session_id.to_be_bytes());
        plaintext[41] = self.flags;
        plaintext
    }

    /// Whether the client asked for unordered (UDP) delivery.
    pub fn is_unordered(&self) -> bool {
        self.flags & UNORDERED_FLAG != 0
    }

    /// The encryption method, if the byte names a known one.
    pub fn encryption(&self) -> Option<EncryptionMethod> {
        EncryptionMethod::from_byte(self.encryption_method)
    }
}
