//! Boundary between the handshake and the session layer.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::auth::{ClientMetadata, EncryptionMethod, SessionKey};
use crate::crypto::Aead;
use crate::disguise::PreparedConn;
use crate::error::{Error, Result};

/// An authenticated connection ready for the session layer.
pub struct Handoff<S = TcpStream> {
    pub metadata: ClientMetadata,
    pub session_key: SessionKey,
    pub conn: PreparedConn<S>,
    pub peer: SocketAddr,
}

impl<S> Handoff<S> {
    /// Whether session frames travel inside TLS-style records.
    pub fn record_framing(&self) -> bool {
        self.conn.transport().has_record_layer()
    }

    /// Payload cipher the client asked for, keyed by the session key.
    ///
    /// `None` means payloads travel unencrypted inside the disguise.
    pub fn payload_cipher(&self) -> Result<Option<Aead>> {
        let key = self.session_key.to_aead_key();
        match self.metadata.encryption() {
            Some(EncryptionMethod::Plain) => Ok(None),
            Some(EncryptionMethod::AesGcm) => Ok(Some(Aead::aes_gcm(&key))),
            Some(EncryptionMethod::ChaCha20Poly1305) => Ok(Some(Aead::chacha20_poly1305(&key))),
            None => Err(Error::handshake(format!(
                "unknown encryption method {:#04x}",
                self.metadata.encryption_method
            ))),
        }
    }
}

/// Consumer of authenticated connections.
#[async_trait]
pub trait SessionHandoff: Send + Sync {
    async fn hand_off(&self, handoff: Handoff) -> Result<()>;
}

/// Hands connections over through a bounded channel.
#[derive(Clone)]
pub struct ChannelHandoff {
    tx: mpsc::Sender<Handoff>,
}

impl ChannelHandoff {
    /// A handoff and the receiver the session layer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Handoff>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SessionHandoff for ChannelHandoff {
    async fn hand_off(&self, handoff: Handoff) -> Result<()> {
        self.tx
            .send(handoff)
            .await
            .map_err(|_| Error::handshake("session layer has gone away"))
    }
}
