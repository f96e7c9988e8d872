//! Disguise protocols.
//!
//! A Cloak client's first packet looks like the opening of some ordinary
//! protocol. This module recognises which one, pulls out the hidden
//! [`AuthBlob`], and once the server decides to accept, completes the
//! protocol's handshake in a way that also delivers the sealed reply.
//!
//! | Transport | First byte | Blob location                  | Record layer |
//! |-----------|------------|--------------------------------|--------------|
//! | TLS       | `0x16`     | SessionTicket extension        | yes          |
//! | WebSocket | `G`        | base64 `hidden` request header | no           |

pub mod browser;
mod conn;
pub mod tls;
pub mod websocket;

pub use browser::Browser;
pub use conn::PreparedConn;

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{AuthBlob, REPLY_LEN};
use crate::error::{Error, Result};

/// Disguise protocol a first packet claims to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Tls,
    WebSocket,
}

impl Transport {
    /// Classify a first packet by its first byte alone.
    pub fn detect(first_packet: &[u8]) -> Result<Self> {
        match first_packet.first() {
            Some(0x16) => Ok(Transport::Tls),
            Some(b'G') => Ok(Transport::WebSocket),
            _ => Err(Error::UnrecognizedProtocol),
        }
    }

    /// Parse the envelope and pull out the blob.
    pub fn extract(self, first_packet: &[u8]) -> Result<Extracted> {
        match self {
            Transport::Tls => {
                let (blob, ctx) = tls::extract(first_packet)?;
                Ok(Extracted {
                    blob,
                    envelope: Envelope::Tls(ctx),
                })
            }
            Transport::WebSocket => {
                let (blob, ctx) = websocket::extract(first_packet)?;
                Ok(Extracted {
                    blob,
                    envelope: Envelope::WebSocket(ctx),
                })
            }
        }
    }

    /// Whether session data travels in TLS-style records.
    pub fn has_record_layer(self) -> bool {
        match self {
            Transport::Tls => true,
            Transport::WebSocket => false,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tls => f.write_str("TLS"),
            Transport::WebSocket => f.write_str("WebSocket"),
        }
    }
}

/// Blob plus whatever the envelope needs to be completed later.
#[derive(Debug)]
pub struct Extracted {
    pub blob: AuthBlob,
    pub envelope: Envelope,
}

/// Per-connection state for finishing a disguise handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    Tls(tls::ServerHelloContext),
    WebSocket(websocket::UpgradeContext),
}

impl Envelope {
    pub fn transport(&self) -> Transport {
        match self {
            Envelope::Tls(_) => Transport::Tls,
            Envelope::WebSocket(_) => Transport::WebSocket,
        }
    }

    /// Complete the handshake on `stream`, delivering `reply`.
    ///
    /// On a write failure the stream is shut down and dropped.
    pub async fn complete<S>(self, mut stream: S, reply: &[u8; REPLY_LEN]) -> Result<PreparedConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Envelope::Tls(ctx) => {
                let bytes = tls::compose_server_reply(&ctx, reply);
                if let Err(e) = stream.write_all(&bytes).await {
                    let _ = stream.shutdown().await;
                    return Err(e.into());
                }
                Ok(PreparedConn::Tls(stream))
            }
            Envelope::WebSocket(ctx) => {
                let ws = websocket::complete(stream, &ctx, reply).await?;
                Ok(PreparedConn::WebSocket(ws))
            }
        }
    }
}
