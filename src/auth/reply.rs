//! Server reply carrying the session key.
//!
//! ```text
//! [12 bytes nonce][32 bytes encrypted session key][16 bytes authentication tag]
//! ```

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{ciphertext_len, Aead, AeadKey, Nonce, SecureRandom, SharedSecret, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};

/// Length of the session key handed to the session layer.
pub const SESSION_KEY_LEN: usize = KEY_SIZE;

/// Length of the reply: nonce plus sealed session key.
pub const REPLY_LEN: usize = NONCE_SIZE + ciphertext_len(SESSION_KEY_LEN);

/// Symmetric key for the downstream session layer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Fresh key from the OS entropy source.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Copy into an AEAD key.
    pub fn to_aead_key(&self) -> AeadKey {
        AeadKey::from_bytes(self.0)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypt `session_key` under the handshake's shared secret with a fresh nonce.
pub fn seal_reply(shared_secret: &SharedSecret, session_key: &SessionKey) -> Result<[u8; REPLY_LEN]> {
    let nonce = Nonce::random();
    let aead = Aead::aes_gcm(&shared_secret.to_aead_key());
    let sealed = aead.encrypt(&nonce, session_key.as_bytes(), b"")?;

    let mut reply = [0u8; REPLY_LEN];
    reply[..NONCE_SIZE].copy_from_slice(nonce.as_bytes());
    reply[NONCE_SIZE..].copy_from_slice(&sealed);
    Ok(reply)
}

/// Recover the session key from a server reply.
pub fn open_reply(shared_secret: &SharedSecret, reply: &[u8]) -> Result<SessionKey> {
    if reply.len() != REPLY_LEN {
        return Err(Error::Buffer {
            expected: REPLY_LEN,
            actual: reply.len(),
        });
    }

    let nonce = Nonce::from_slice(&reply[..NONCE_SIZE])?;
    let aead = Aead::aes_gcm(&shared_secret.to_aead_key());
    let mut opened = aead
        .decrypt(&nonce, &reply[NONCE_SIZE..], b"")
        .map_err(|_| Error::handshake("failed to decrypt session key"))?;

    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&opened);
    opened.zeroize();
    Ok(SessionKey(key))
}
