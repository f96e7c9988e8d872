//! AEAD ciphers.
//!
//! The handshake itself always uses AES-256-GCM. ChaCha20-Poly1305 is offered
//! for the session layer when the client negotiates it.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead as AeadTrait, KeyInit, Payload},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// 256-bit AEAD key, zeroized on drop.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for AeadKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 96-bit AEAD nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice, which must be exactly [`NONCE_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| Error::Buffer {
            expected: NONCE_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Generate a fresh nonce from the OS entropy source.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// AEAD cipher, either AES-256-GCM or ChaCha20-Poly1305.
pub enum Aead {
    /// AES-256-GCM
    AesGcm(Aes256Gcm),
    /// ChaCha20-Poly1305
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl Aead {
    /// AES-256-GCM keyed with `key`.
    pub fn aes_gcm(key: &AeadKey) -> Self {
        Aead::AesGcm(Aes256Gcm::new(key.as_bytes().into()))
    }

    /// ChaCha20-Poly1305 keyed with `key`.
    pub fn chacha20_poly1305(key: &AeadKey) -> Self {
        Aead::ChaCha20Poly1305(ChaCha20Poly1305::new(key.as_bytes().into()))
    }

    /// Seal `plaintext`, returning `ciphertext || tag`.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let nonce = GenericArray::from_slice(nonce.as_bytes());

        let sealed = match self {
            Aead::AesGcm(cipher) => cipher.encrypt(nonce, payload),
            Aead::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, payload),
        };
        sealed.map_err(|_| Error::crypto("encryption failed"))
    }

    /// Open `ciphertext || tag`; any authentication failure is a crypto error.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let nonce = GenericArray::from_slice(nonce.as_bytes());

        let opened = match self {
            Aead::AesGcm(cipher) => cipher.decrypt(nonce, payload),
            Aead::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, payload),
        };
        opened.map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

/// Sealed length of a `plaintext_len`-byte message.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}
