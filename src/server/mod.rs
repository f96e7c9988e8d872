//! Cloak server.
//!
//! Every inbound connection gets one bounded read. That first packet either
//! authenticates as a Cloak client, in which case the disguise handshake is
//! completed and the connection is handed to the session layer, or it does
//! not, in which case it is treated exactly like any other visitor:
//!
//! ```text
//!                  ┌──────────────┐  accepted   ┌──────────────┐
//!  first packet ──▶│ auth_first_  │────────────▶│  Finisher    │──▶ SessionHandoff
//!                  │ packet + UID │             └──────────────┘
//!                  └──────┬───────┘
//!                         │ any rejection
//!                         ▼
//!                  redirect_addr set? ──yes──▶ forward bytes, splice both ways
//!                         │no
//!                         ▼
//!                    close silently
//! ```

mod config;
mod handoff;
mod handshake;
mod metrics;
mod state;

pub use config::{ServerConfig, ServerConfigFile, DEFAULT_FIRST_PACKET_TIMEOUT};
pub use handoff::{ChannelHandoff, Handoff, SessionHandoff};
pub use handshake::{auth_first_packet, Accepted, Finisher, HandshakeOutcome};
pub use metrics::{MetricsSnapshot, RejectReason, ServerMetrics};
pub use state::State;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::auth::SessionKey;
use crate::error::{Error, Result};

/// Largest first packet read before deciding.
pub const FIRST_PACKET_MAX: usize = 1500;

/// Main server instance.
pub struct Server {
    config: Arc<ServerConfig>,
    state: Arc<State>,
    metrics: Arc<ServerMetrics>,
    handoff: Arc<dyn SessionHandoff>,
}

impl Server {
    /// Create a server on the system clock.
    pub fn new(config: ServerConfig, handoff: Arc<dyn SessionHandoff>) -> Self {
        let state = State::with_system_clock(&config);
        Self::with_state(config, state, handoff)
    }

    /// Create a server around prepared state.
    pub fn with_state(config: ServerConfig, state: State, handoff: Arc<dyn SessionHandoff>) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(state),
            metrics: Arc::new(ServerMetrics::new()),
            handoff,
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Cloak server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let config = Arc::clone(&self.config);
                    let state = Arc::clone(&self.state);
                    let metrics = Arc::clone(&self.metrics);
                    let handoff = Arc::clone(&self.handoff);

                    tokio::spawn(async move {
                        metrics.increment_connections();

                        if let Err(e) = Self::handle_connection(
                            config,
                            state,
                            metrics.clone(),
                            handoff,
                            stream,
                            peer_addr,
                        )
                        .await
                        {
                            tracing::debug!("Connection error from {}: {}", peer_addr, e);
                        }

                        metrics.decrement_connections();
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        config: Arc<ServerConfig>,
        state: Arc<State>,
        metrics: Arc<ServerMetrics>,
        handoff: Arc<dyn SessionHandoff>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        let mut buf = vec![0u8; FIRST_PACKET_MAX];
        let n = match timeout(config.first_packet_timeout, stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                metrics.increment_timeouts();
                return Err(Error::Timeout(config.first_packet_timeout.as_millis() as u64));
            }
        };
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);

        let outcome = auth_first_packet(&buf, &state).and_then(|accepted| {
            if state.is_authorised(&accepted.metadata.uid) {
                Ok(accepted)
            } else {
                Err(Error::UnauthorisedUid)
            }
        });

        let Accepted {
            metadata,
            transport,
            finisher,
        } = match outcome {
            Ok(accepted) => accepted,
            Err(e) if e.is_first_packet_rejection() => {
                if let Some(reason) = RejectReason::of(&e) {
                    metrics.record_rejection(reason);
                }
                tracing::debug!("Rejected first packet from {}: {}", peer_addr, e);
                return Self::fall_back(&config, &metrics, stream, buf).await;
            }
            Err(e) => {
                // Still indistinguishable from foreign traffic on the wire.
                metrics.increment_handshake_errors();
                tracing::debug!("Handshake error from {}: {}", peer_addr, e);
                return Self::fall_back(&config, &metrics, stream, buf).await;
            }
        };

        let session_key = SessionKey::random();
        let conn = match finisher.finish(stream, &session_key).await {
            Ok(conn) => conn,
            Err(e) => {
                metrics.increment_handshake_errors();
                return Err(e);
            }
        };

        tracing::info!(
            "Accepted {} session from {} for {} at {} (session {})",
            transport,
            peer_addr,
            metadata.proxy_method,
            state.backend(&metadata.proxy_method).unwrap_or_default(),
            metadata.session_id
        );
        metrics.increment_accepted();

        let result = handoff
            .hand_off(Handoff {
                metadata,
                session_key,
                conn,
                peer: peer_addr,
            })
            .await;
        if result.is_err() {
            metrics.increment_handshake_errors();
        }
        result
    }

    /// Treat the connection as foreign: hand it to the decoy, or just close it.
    async fn fall_back(
        config: &ServerConfig,
        metrics: &ServerMetrics,
        mut client: TcpStream,
        first_packet: Vec<u8>,
    ) -> Result<()> {
        let Some(redirect_addr) = config.redirect_addr.as_deref() else {
            metrics.increment_dropped();
            return Ok(());
        };
        metrics.increment_redirected();

        let mut decoy = TcpStream::connect(redirect_addr).await?;
        decoy.set_nodelay(true)?;

        // Forward the bytes already consumed
        decoy.write_all(&first_packet).await?;

        tokio::io::copy_bidirectional(&mut client, &mut decoy).await?;

        Ok(())
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Shared handshake state.
    pub fn state(&self) -> &State {
        &self.state
    }
}
