//! Process-wide handshake state.

use std::collections::HashMap;
use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::auth::{Clock, ReplayGuard, SystemClock, TimestampWindow, UID_LEN};
use crate::crypto::StaticSecret;
use crate::server::ServerConfig;

/// Everything a handshake needs beyond the packet itself.
///
/// Built once per process and shared by every connection task.
pub struct State {
    pub(crate) static_secret: StaticSecret,
    pub(crate) proxy_book: HashMap<String, String>,
    bypass_uids: Vec<[u8; UID_LEN]>,
    pub(crate) replay: ReplayGuard,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) window: TimestampWindow,
}

impl State {
    /// Assemble state; the replay guard covers twice the window tolerance.
    pub fn new(
        static_secret: StaticSecret,
        proxy_book: HashMap<String, String>,
        bypass_uids: Vec<[u8; UID_LEN]>,
        clock: Arc<dyn Clock>,
        window: TimestampWindow,
    ) -> Self {
        let replay = ReplayGuard::new(window.tolerance().saturating_mul(2), Arc::clone(&clock));
        Self {
            static_secret,
            proxy_book,
            bypass_uids,
            replay,
            clock,
            window,
        }
    }

    /// State for `config`, reading time from `clock`.
    pub fn from_config(config: &ServerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.static_secret.clone(),
            config.proxy_book.clone(),
            config.bypass_uids.clone(),
            clock,
            TimestampWindow::new(config.timestamp_tolerance, config.timestamp_granularity),
        )
    }

    /// State for `config` on the system clock.
    pub fn with_system_clock(config: &ServerConfig) -> Self {
        Self::from_config(config, Arc::new(SystemClock))
    }

    /// Backend address for a proxy method.
    pub fn backend(&self, proxy_method: &str) -> Option<&str> {
        self.proxy_book.get(proxy_method).map(String::as_str)
    }

    /// Whether `uid` is on the allow-list.
    ///
    /// Every entry is compared in constant time and the scan never stops early.
    pub fn is_authorised(&self, uid: &[u8; UID_LEN]) -> bool {
        let found = self
            .bypass_uids
            .iter()
            .fold(subtle::Choice::from(0), |acc, allowed| acc | allowed[..].ct_eq(&uid[..]));
        found.into()
    }

    /// The replay guard, for diagnostics.
    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }
}
