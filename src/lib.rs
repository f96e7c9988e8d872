//! # Cloak handshake core
//!
//! Lets a proxy server share a port with an ordinary web service. A client's
//! first packet is a normal-looking TLS ClientHello or WebSocket upgrade with
//! an encrypted credential hidden inside it. The server authenticates that
//! credential without a round trip; anything that fails is forwarded to a
//! decoy web server (or silently closed), byte for byte, so a prober only
//! ever sees the decoy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           Session layer (embedder, via handoff)          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Server: first-packet read, fallback, metrics, handoff   │
//! │  Client: config, dial, prepare                           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Disguise (TLS ClientHello / WebSocket upgrade codecs)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Auth (hidden metadata, timestamp window, replay guard)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (X25519, AES-256-GCM, ChaCha20-Poly1305)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Indistinguishability**: a rejected connection is handled exactly like
//!    traffic that was never Cloak at all
//! 2. **Zero round trips**: authentication rides in the first packet
//! 3. **Replay resistance**: every ephemeral key is accepted at most once

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod client;
pub mod crypto;
pub mod disguise;
pub mod error;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};
