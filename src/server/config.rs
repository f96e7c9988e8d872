//! Server configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::auth::{MAX_TIMESTAMP_TOLERANCE, TIMESTAMP_TOLERANCE, UID_LEN};
use crate::crypto::{PublicKey, SecureRandom, StaticSecret};
use crate::error::{Error, Result};

/// Default bound on how long a client may take to send its first packet.
pub const DEFAULT_FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(3);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    pub listen_addr: String,
    /// Decoy that receives every rejected connection; closed silently when unset
    pub redirect_addr: Option<String>,
    /// Server's static secret key
    pub static_secret: StaticSecret,
    /// Proxy method name to backend address
    pub proxy_book: HashMap<String, String>,
    /// UIDs allowed to open sessions
    pub bypass_uids: Vec<[u8; UID_LEN]>,
    /// Half-width of the timestamp window
    pub timestamp_tolerance: Duration,
    /// Granularity of the window's lower bound
    pub timestamp_granularity: Duration,
    /// How long to wait for the first packet
    pub first_packet_timeout: Duration,
}

impl ServerConfig {
    /// Create a new configuration with a random keypair.
    pub fn new_random(listen_addr: impl Into<String>, redirect_addr: Option<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            redirect_addr,
            static_secret: StaticSecret::random(),
            proxy_book: HashMap::new(),
            bypass_uids: Vec::new(),
            timestamp_tolerance: TIMESTAMP_TOLERANCE,
            timestamp_granularity: Duration::from_secs(1),
            first_packet_timeout: DEFAULT_FIRST_PACKET_TIMEOUT,
        }
    }

    /// Get the server's public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.static_secret)
    }

    /// Register a proxy method.
    pub fn add_proxy(&mut self, method: impl Into<String>, backend: impl Into<String>) {
        self.proxy_book.insert(method.into(), backend.into());
    }

    /// Add an allowed UID.
    pub fn add_uid(&mut self, uid: [u8; UID_LEN]) {
        if !self.bypass_uids.contains(&uid) {
            self.bypass_uids.push(uid);
        }
    }

    /// Generate a random UID and add it.
    pub fn generate_uid(&mut self) -> [u8; UID_LEN] {
        let uid: [u8; UID_LEN] = SecureRandom::bytes();
        self.add_uid(uid);
        uid
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if matches!(self.redirect_addr.as_deref(), Some("")) {
            return Err(Error::config("redirect_addr cannot be empty when set"));
        }
        if self.proxy_book.is_empty() {
            return Err(Error::config("at least one proxy method must be configured"));
        }
        if self.bypass_uids.is_empty() {
            return Err(Error::config("at least one UID must be configured"));
        }
        if self.timestamp_tolerance > MAX_TIMESTAMP_TOLERANCE {
            return Err(Error::config(format!(
                "timestamp_tolerance must be at most {} seconds",
                MAX_TIMESTAMP_TOLERANCE.as_secs()
            )));
        }
        if self.timestamp_granularity.is_zero() {
            return Err(Error::config("timestamp_granularity must be positive"));
        }
        if self.first_packet_timeout.is_zero() {
            return Err(Error::config("first_packet_timeout must be positive"));
        }
        Ok(())
    }
}

fn default_tolerance_secs() -> u64 {
    TIMESTAMP_TOLERANCE.as_secs()
}

fn default_granularity_secs() -> u64 {
    1
}

fn default_first_packet_timeout_secs() -> u64 {
    DEFAULT_FIRST_PACKET_TIMEOUT.as_secs()
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Decoy address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_addr: Option<String>,
    /// Server's static secret key (base64)
    pub private_key: String,
    /// Allowed UIDs (base64)
    #[serde(default)]
    pub bypass_uids: Vec<String>,
    #[serde(default = "default_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,
    #[serde(default = "default_granularity_secs")]
    pub timestamp_granularity_secs: u64,
    #[serde(default = "default_first_packet_timeout_secs")]
    pub first_packet_timeout_secs: u64,
    /// Proxy method name to backend address; kept last so it renders as a table
    #[serde(default)]
    pub proxy_book: HashMap<String, String>,
}

impl ServerConfigFile {
    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid server config: {}", e)))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let secret_bytes = STANDARD
            .decode(&self.private_key)
            .map_err(|e| Error::config(format!("invalid base64 private_key: {}", e)))?;
        let secret_arr: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::config("private_key must be 32 bytes"))?;

        let mut bypass_uids = Vec::with_capacity(self.bypass_uids.len());
        for encoded in &self.bypass_uids {
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| Error::config(format!("invalid base64 UID: {}", e)))?;
            let uid: [u8; UID_LEN] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::config(format!("UID must be {} bytes", UID_LEN)))?;
            bypass_uids.push(uid);
        }

        Ok(ServerConfig {
            listen_addr: self.listen_addr.clone(),
            redirect_addr: self.redirect_addr.clone(),
            static_secret: StaticSecret::from_bytes(secret_arr),
            proxy_book: self.proxy_book.clone(),
            bypass_uids,
            timestamp_tolerance: Duration::from_secs(self.timestamp_tolerance_secs),
            timestamp_granularity: Duration::from_secs(self.timestamp_granularity_secs),
            first_packet_timeout: Duration::from_secs(self.first_packet_timeout_secs),
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            redirect_addr: config.redirect_addr.clone(),
            private_key: STANDARD.encode(config.static_secret.to_bytes()),
            bypass_uids: config.bypass_uids.iter().map(|uid| STANDARD.encode(uid)).collect(),
            timestamp_tolerance_secs: config.timestamp_tolerance.as_secs(),
            timestamp_granularity_secs: config.timestamp_granularity.as_secs(),
            first_packet_timeout_secs: config.first_packet_timeout.as_secs(),
            proxy_book: config.proxy_book.clone(),
        }
    }
}
