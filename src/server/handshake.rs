//! First-packet authentication.
//!
//! ```text
//! detect -> extract -> replay check -> decrypt + timestamp -> proxy method
//! ```
//!
//! The replay check comes before decryption: the AEAD nonce is derived from
//! the ephemeral key, so a repeated key must never reach the cipher. Nothing
//! is written to the wire here; the caller decides whether to call
//! [`Finisher::finish`] or treat the connection as foreign.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::{authenticate, seal_reply, Authenticated, ClientMetadata, SessionKey};
use crate::crypto::SharedSecret;
use crate::disguise::{Envelope, Extracted, PreparedConn, Transport};
use crate::error::{Error, Result};
use crate::server::State;

/// A first packet that passed authentication.
#[derive(Debug)]
pub struct Accepted {
    pub metadata: ClientMetadata,
    pub transport: Transport,
    pub finisher: Finisher,
}

/// Outcome of [`auth_first_packet`].
pub type HandshakeOutcome = Result<Accepted>;

/// One-shot completion of an accepted handshake.
pub struct Finisher {
    shared_secret: SharedSecret,
    envelope: Envelope,
}

impl Finisher {
    /// Seal `session_key` and complete the disguise handshake on `stream`.
    pub async fn finish<S>(self, stream: S, session_key: &SessionKey) -> Result<PreparedConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reply = seal_reply(&self.shared_secret, session_key)?;
        self.envelope.complete(stream, &reply).await
    }
}

impl fmt::Debug for Finisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finisher")
            .field("transport", &self.envelope.transport())
            .finish_non_exhaustive()
    }
}

/// Authenticate the first packet of a connection.
///
/// UID authorisation is left to the caller (see [`State::is_authorised`]).
pub fn auth_first_packet(first_packet: &[u8], state: &State) -> HandshakeOutcome {
    let transport = Transport::detect(first_packet)?;
    let Extracted { blob, envelope } = transport.extract(first_packet)?;

    if state.replay.register(&blob.ephemeral_public) {
        return Err(Error::Replay);
    }

    let Authenticated {
        metadata,
        shared_secret,
    } = authenticate(&blob, &state.static_secret, state.clock.as_ref(), &state.window)?;

    if state.backend(&metadata.proxy_method).is_none() {
        return Err(Error::BadProxyMethod(metadata.proxy_method));
    }

    Ok(Accepted {
        metadata,
        transport,
        finisher: Finisher {
            shared_secret,
            envelope,
        },
    })
}
