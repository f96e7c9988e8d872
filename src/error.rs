//! Error types for the Cloak handshake core.

use thiserror::Error;

/// Result type alias for Cloak operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while sniffing, authenticating or completing a handshake.
#[derive(Error, Debug)]
pub enum Error {
    /// First packet matches no disguise protocol, or is a well-formed envelope
    /// that does not carry a valid Cloak credential.
    #[error("unrecognised protocol")]
    UnrecognizedProtocol,

    /// Structurally broken TLS or HTTP framing
    #[error("malformed {transport} envelope: {reason}")]
    MalformedEnvelope {
        /// Disguise protocol being parsed
        transport: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Client timestamp outside of the accepting window
    #[error("timestamp is outside of the accepting window: received timestamp {received}")]
    TimestampOutOfWindow {
        /// UNIX seconds carried in the hidden metadata
        received: i64,
    },

    /// Ephemeral public key already seen
    #[error("duplicate random")]
    Replay,

    /// Proxy method not present in the proxy book
    #[error("invalid proxy method {0:?}")]
    BadProxyMethod(String),

    /// UID not present in the allow-list
    #[error("UID is not authorised")]
    UnauthorisedUid,

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Handshake protocol error (client side, or completion)
    #[error("handshake error: {0}")]
    Handshake(String),

    /// WebSocket framing error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Operation timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a malformed TLS envelope error
    pub fn malformed_tls(reason: impl Into<String>) -> Self {
        Error::MalformedEnvelope {
            transport: "TLS",
            reason: reason.into(),
        }
    }

    /// Create a malformed WebSocket envelope error
    pub fn malformed_ws(reason: impl Into<String>) -> Self {
        Error::MalformedEnvelope {
            transport: "WebSocket",
            reason: reason.into(),
        }
    }

    /// Whether this error rejects a first packet.
    ///
    /// Every such rejection must be handled exactly like ordinary non-Cloak
    /// traffic: the connection goes to the decoy or is silently closed.
    pub fn is_first_packet_rejection(&self) -> bool {
        matches!(
            self,
            Error::UnrecognizedProtocol
                | Error::MalformedEnvelope { .. }
                | Error::TimestampOutOfWindow { .. }
                | Error::Replay
                | Error::BadProxyMethod(_)
                | Error::UnauthorisedUid
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Io(io) => Error::Network(io),
            other => Error::WebSocket(other.to_string()),
        }
    }
}
