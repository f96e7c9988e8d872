//! Server metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Error;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total connections accepted by the listener
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Handshakes completed and handed to the session layer
    accepted_handshakes: AtomicU64,
    /// Rejected connections forwarded to the decoy
    redirected_connections: AtomicU64,
    /// Rejected connections closed without a decoy
    dropped_connections: AtomicU64,
    /// First packets that never arrived in time
    first_packet_timeouts: AtomicU64,
    /// Rejections by cause, indexed by [`RejectReason`]
    rejections: [AtomicU64; RejectReason::COUNT],
    /// Failures after acceptance (reply write, handoff)
    handshake_errors: AtomicU64,
}

/// Why a first packet was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Unrecognized,
    Malformed,
    Timestamp,
    Replay,
    ProxyMethod,
    Uid,
}

impl RejectReason {
    const COUNT: usize = 6;

    const ALL: [RejectReason; Self::COUNT] = [
        RejectReason::Unrecognized,
        RejectReason::Malformed,
        RejectReason::Timestamp,
        RejectReason::Replay,
        RejectReason::ProxyMethod,
        RejectReason::Uid,
    ];

    /// Classify a first-packet rejection; `None` for any other error.
    pub fn of(err: &Error) -> Option<Self> {
        match err {
            Error::UnrecognizedProtocol => Some(RejectReason::Unrecognized),
            Error::MalformedEnvelope { .. } => Some(RejectReason::Malformed),
            Error::TimestampOutOfWindow { .. } => Some(RejectReason::Timestamp),
            Error::Replay => Some(RejectReason::Replay),
            Error::BadProxyMethod(_) => Some(RejectReason::ProxyMethod),
            Error::UnauthorisedUid => Some(RejectReason::Uid),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            RejectReason::Unrecognized => "Unrecognised",
            RejectReason::Malformed => "Malformed",
            RejectReason::Timestamp => "Timestamp",
            RejectReason::Replay => "Replay",
            RejectReason::ProxyMethod => "Proxy Method",
            RejectReason::Uid => "UID",
        }
    }
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            accepted_handshakes: AtomicU64::new(0),
            redirected_connections: AtomicU64::new(0),
            dropped_connections: AtomicU64::new(0),
            first_packet_timeouts: AtomicU64::new(0),
            rejections: Default::default(),
            handshake_errors: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increment_accepted(&self) {
        self.accepted_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_redirected(&self) {
        self.redirected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.dropped_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_timeouts(&self) {
        self.first_packet_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handshake_errors(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejection under its cause.
    pub fn record_rejection(&self, reason: RejectReason) {
        self.rejections[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn accepted_handshakes(&self) -> u64 {
        self.accepted_handshakes.load(Ordering::Relaxed)
    }

    /// Rejections recorded under `reason`.
    pub fn rejections(&self, reason: RejectReason) -> u64 {
        self.rejections[reason.index()].load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            accepted_handshakes: self.accepted_handshakes(),
            redirected_connections: self.redirected_connections.load(Ordering::Relaxed),
            dropped_connections: self.dropped_connections.load(Ordering::Relaxed),
            first_packet_timeouts: self.first_packet_timeouts.load(Ordering::Relaxed),
            rejections: RejectReason::ALL.map(|r| self.rejections(r)),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        let mut rejections = String::new();
        for reason in RejectReason::ALL {
            rejections.push_str(&format!(
                "  {:<14}{}\n",
                format!("{}:", reason.label()),
                snapshot.rejections[reason.index()]
            ));
        }

        format!(
            r#"Cloak Server Metrics
====================
Uptime: {} seconds

Connections:
  Total:      {}
  Active:     {}
  Accepted:   {}
  Redirected: {}
  Dropped:    {}
  Timed Out:  {}

Rejections:
{}
Errors:
  Handshake Errors: {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.accepted_handshakes,
            snapshot.redirected_connections,
            snapshot.dropped_connections,
            snapshot.first_packet_timeouts,
            rejections,
            snapshot.handshake_errors,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub accepted_handshakes: u64,
    pub redirected_connections: u64,
    pub dropped_connections: u64,
    pub first_packet_timeouts: u64,
    pub rejections: [u64; RejectReason::COUNT],
    pub handshake_errors: u64,
}

impl MetricsSnapshot {
    /// Total rejected first packets.
    pub fn total_rejections(&self) -> u64 {
        self.rejections.iter().sum()
    }

    /// Share of connections that completed a handshake.
    pub fn accept_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.accepted_handshakes as f64 / self.total_connections as f64
        }
    }
}
