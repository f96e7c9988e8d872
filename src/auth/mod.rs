//! Authentication engine.
//!
//! A Cloak client hides a 96-byte blob inside its disguise envelope:
//!
//! ```text
//! [0..32]   ephemeral X25519 public key
//! [32..96]  AES-256-GCM(metadata[42] || reserved[6]) || tag[16]
//! ```
//!
//! The reserved bytes are zero when sealing and ignored when opening.
//!
//! The AEAD key is X25519(server static, client ephemeral) and the nonce is
//! the first 12 bytes of the ephemeral public key. That nonce is deterministic
//! per key, which is only sound because each key is rejected on reuse by the
//! [`ReplayGuard`] *before* any decryption is attempted.

mod clock;
mod metadata;
mod replay;
mod reply;

pub use clock::{unix_secs, Clock, ManualClock, SystemClock};
pub use metadata::{
    ClientMetadata, EncryptionMethod, METADATA_LEN, PROXY_METHOD_LEN, UID_LEN, UNORDERED_FLAG,
};
pub use replay::ReplayGuard;
pub use reply::{open_reply, seal_reply, SessionKey, REPLY_LEN, SESSION_KEY_LEN};

use std::time::Duration;

use crate::crypto::{
    ciphertext_len, Aead, EphemeralSecret, Nonce, PublicKey, SharedSecret, StaticSecret,
    NONCE_SIZE, PUBLIC_KEY_SIZE,
};
use crate::error::{Error, Result};

/// Metadata plus reserved padding, as encrypted.
pub const SEALED_PLAINTEXT_LEN: usize = 48;

/// Length of the sealed metadata.
pub const CIPHERTEXT_LEN: usize = ciphertext_len(SEALED_PLAINTEXT_LEN);

/// Length of the whole hidden blob.
pub const AUTH_BLOB_LEN: usize = PUBLIC_KEY_SIZE + CIPHERTEXT_LEN;

/// Half-width of the timestamp acceptance window.
pub const TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(3 * 60 * 60);

/// Largest tolerance a server may be configured with.
pub const MAX_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Hidden authentication payload as found on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthBlob {
    /// Client ephemeral public key
    pub ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    /// Sealed metadata with tag
    pub ciphertext_with_tag: [u8; CIPHERTEXT_LEN],
}

impl AuthBlob {
    /// Parse a blob; anything but exactly [`AUTH_BLOB_LEN`] bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AUTH_BLOB_LEN {
            return Err(Error::Buffer {
                expected: AUTH_BLOB_LEN,
                actual: bytes.len(),
            });
        }

        let mut ephemeral_public = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_public.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut ciphertext_with_tag = [0u8; CIPHERTEXT_LEN];
        ciphertext_with_tag.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);

        Ok(Self {
            ephemeral_public,
            ciphertext_with_tag,
        })
    }

    /// Serialise to wire bytes.
    pub fn to_bytes(&self) -> [u8; AUTH_BLOB_LEN] {
        let mut out = [0u8; AUTH_BLOB_LEN];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.ephemeral_public);
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.ciphertext_with_tag);
        out
    }

    /// AEAD nonce: the leading bytes of the ephemeral key.
    pub fn nonce(&self) -> Nonce {
        let mut n = [0u8; NONCE_SIZE];
        n.copy_from_slice(&self.ephemeral_public[..NONCE_SIZE]);
        Nonce::from_bytes(n)
    }
}

/// Acceptance window for client timestamps.
///
/// With `now` in whole UNIX seconds, a timestamp `t` is accepted iff
/// `floor(now - tolerance, granularity) <= t <= now + tolerance`.
/// Coarser granularity caps how many distinct lower bounds a prober can
/// observe; one second makes the window exactly symmetric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampWindow {
    tolerance: Duration,
    granularity: Duration,
}

impl TimestampWindow {
    /// Window of ±`tolerance`, lower bound floored to `granularity`.
    pub fn new(tolerance: Duration, granularity: Duration) -> Self {
        Self {
            tolerance,
            granularity,
        }
    }

    /// Half-width of the window.
    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Inclusive `(lower, upper)` bounds for the given server time.
    pub fn bounds(&self, now_secs: i64) -> (i64, i64) {
        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        let granularity = i64::try_from(self.granularity.as_secs().max(1)).unwrap_or(i64::MAX);

        let lower = now_secs
            .saturating_sub(tolerance)
            .div_euclid(granularity)
            .saturating_mul(granularity);
        (lower, now_secs.saturating_add(tolerance))
    }

    /// Check `timestamp` against the window at `now_secs`.
    pub fn check(&self, now_secs: i64, timestamp: i64) -> Result<()> {
        let (lower, upper) = self.bounds(now_secs);
        if lower <= timestamp && timestamp <= upper {
            Ok(())
        } else {
            Err(Error::TimestampOutOfWindow {
                received: timestamp,
            })
        }
    }
}

impl Default for TimestampWindow {
    fn default() -> Self {
        Self::new(TIMESTAMP_TOLERANCE, Duration::from_secs(1))
    }
}

/// Output of a successful [`authenticate`].
pub struct Authenticated {
    /// Decrypted client metadata
    pub metadata: ClientMetadata,
    /// Per-handshake secret, needed again to seal the reply
    pub shared_secret: SharedSecret,
}

/// Decrypt and validate a blob.
///
/// ECDH and AEAD failures both come back as [`Error::UnrecognizedProtocol`]:
/// a blob that does not decrypt is indistinguishable from random bytes in a
/// genuine third-party envelope. Proxy method and UID authorisation are left
/// to the caller.
pub fn authenticate(
    blob: &AuthBlob,
    static_secret: &StaticSecret,
    clock: &dyn Clock,
    window: &TimestampWindow,
) -> Result<Authenticated> {
    let ephemeral = PublicKey::from_bytes(blob.ephemeral_public);
    let shared_secret = static_secret.diffie_hellman(&ephemeral).map_err(|e| {
        tracing::debug!("hidden key agreement failed: {}", e);
        Error::UnrecognizedProtocol
    })?;

    let aead = Aead::aes_gcm(&shared_secret.to_aead_key());
    let plaintext = aead
        .decrypt(&blob.nonce(), &blob.ciphertext_with_tag, b"")
        .map_err(|e| {
            tracing::debug!("hidden metadata did not decrypt: {}", e);
            Error::UnrecognizedProtocol
        })?;

    if plaintext.len() != SEALED_PLAINTEXT_LEN {
        return Err(Error::UnrecognizedProtocol);
    }
    let mut fields = [0u8; METADATA_LEN];
    fields.copy_from_slice(&plaintext[..METADATA_LEN]);
    let metadata = ClientMetadata::from_plaintext(&fields);

    window.check(unix_secs(clock.now()), metadata.timestamp)?;

    Ok(Authenticated {
        metadata,
        shared_secret,
    })
}

/// Client side: seal `metadata` for the server owning `server_public`.
///
/// Returns the blob and the shared secret needed to open the server's reply.
pub fn seal_blob(
    metadata: &ClientMetadata,
    server_public: &PublicKey,
) -> Result<(AuthBlob, SharedSecret)> {
    let ephemeral = EphemeralSecret::random();
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared_secret = ephemeral.diffie_hellman(server_public)?;

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&ephemeral_public[..NONCE_SIZE]);

    let mut plaintext = [0u8; SEALED_PLAINTEXT_LEN];
    plaintext[..METADATA_LEN].copy_from_slice(&metadata.to_plaintext());

    let aead = Aead::aes_gcm(&shared_secret.to_aead_key());
    let sealed = aead.encrypt(&Nonce::from_bytes(nonce), &plaintext, b"")?;

    let mut blob = Vec::with_capacity(AUTH_BLOB_LEN);
    blob.extend_from_slice(&ephemeral_public);
    blob.extend_from_slice(&sealed);
    Ok((AuthBlob::from_slice(&blob)?, shared_secret))
}
