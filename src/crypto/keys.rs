//! X25519 keys.
//!
//! The server holds one static secret for its lifetime; each client handshake
//! uses a fresh ephemeral secret. Agreement fails closed when the peer key is
//! a low-order point, since the resulting all-zero secret would be a known
//! AEAD key.

use x25519_dalek::{
    EphemeralSecret as DalekEphemeral, PublicKey as DalekPublic,
    SharedSecret as DalekShared, StaticSecret as DalekStatic,
};
use zeroize::ZeroizeOnDrop;

use crate::crypto::{AeadKey, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};

/// Client secret for exactly one handshake.
///
/// Its public half doubles as the AEAD nonce source.
pub struct EphemeralSecret(DalekEphemeral);

impl EphemeralSecret {
    pub fn random() -> Self {
        Self(DalekEphemeral::random_from_rng(rand::thread_rng()))
    }

    /// Consume the secret and agree on a shared secret.
    pub fn diffie_hellman(self, their_public: &PublicKey) -> Result<SharedSecret> {
        SharedSecret::checked(self.0.diffie_hellman(&their_public.0))
    }
}

impl From<&EphemeralSecret> for PublicKey {
    fn from(secret: &EphemeralSecret) -> Self {
        PublicKey(DalekPublic::from(&secret.0))
    }
}

/// The server's long-term identity key, zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct StaticSecret(DalekStatic);

impl StaticSecret {
    pub fn random() -> Self {
        Self(DalekStatic::random_from_rng(rand::thread_rng()))
    }

    /// Restore a secret saved with [`StaticSecret::to_bytes`].
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(DalekStatic::from(bytes))
    }

    /// Agree on a shared secret with a client's ephemeral key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> Result<SharedSecret> {
        SharedSecret::checked(self.0.diffie_hellman(&their_public.0))
    }

    /// Raw secret bytes, for writing the config file.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey(DalekPublic::from(&secret.0))
    }
}

/// X25519 public key: the server's published key or a client's ephemeral one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(DalekPublic);

impl PublicKey {
    /// Create from raw bytes. Any 32 bytes are accepted here; invalid points
    /// are caught at agreement time.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(DalekPublic::from(bytes))
    }

    /// Create from a slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| Error::Buffer {
            expected: PUBLIC_KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self::from_bytes(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Per-handshake X25519 output, zeroized on drop.
///
/// Keys AES-256-GCM directly for both the hidden blob and the reply.
pub struct SharedSecret(DalekShared);

impl SharedSecret {
    fn checked(shared: DalekShared) -> Result<Self> {
        if shared.was_contributory() {
            Ok(Self(shared))
        } else {
            Err(Error::crypto("non-contributory X25519 public key"))
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Copy the secret into an AEAD key.
    pub fn to_aead_key(&self) -> AeadKey {
        AeadKey::from_bytes(*self.0.as_bytes())
    }
}
