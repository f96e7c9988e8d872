//! Client configuration.
//!
//! A client is configured either from a JSON file or from a
//! semicolon-separated `key=value` string, the form plugin hosts pass on
//! the command line. Both produce a [`RawConfig`], which
//! [`RawConfig::split_configs`] validates and splits into what the local
//! listener, the remote dialer and the handshake each need.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::{EncryptionMethod, PROXY_METHOD_LEN, UID_LEN};
use crate::client::ClientTransport;
use crate::crypto::{PublicKey, SecureRandom};
use crate::error::{Error, Result};

/// Idle timeout for local streams when `StreamTimeout` is unset.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Standalone defaults for address fields the config leaves empty.
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: &str = "1984";
pub const DEFAULT_REMOTE_PORT: &str = "443";

/// Keys whose plugin-string values are JSON literals rather than strings.
const UNQUOTED_KEYS: [&str; 4] = ["NumConn", "StreamTimeout", "KeepAlive", "UDP"];

/// Client configuration as written by the user.
///
/// Field names follow the established client config format. Optional fields
/// get their defaults in [`RawConfig::split_configs`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawConfig {
    /// Domain shown in the SNI of the disguise handshake
    pub server_name: String,
    pub proxy_method: String,
    pub encryption_method: String,
    /// 16-byte UID (base64)
    #[serde(rename = "UID", with = "base64_bytes")]
    pub uid: Vec<u8>,
    /// Server static public key (base64)
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub num_conn: i64,
    pub local_host: String,
    pub local_port: String,
    pub remote_host: String,
    pub remote_port: String,
    #[serde(rename = "UDP")]
    pub udp: bool,
    /// `chrome` (default) or `firefox`
    pub browser_sig: String,
    /// `direct` (default) or `cdn`
    pub transport: String,
    /// Upgrade path in `cdn` mode
    #[serde(rename = "CDNPath")]
    pub cdn_path: String,
    /// Seconds; 0 means the default
    pub stream_timeout: i64,
    /// Seconds; 0 or negative disables keep-alive
    pub keep_alive: i64,
}

/// Settings given on the command line in standalone mode.
///
/// Each one that is set replaces the config value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub local_host: Option<String>,
    pub local_port: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<String>,
    pub udp: bool,
    pub proxy_method: Option<String>,
}

impl ConfigOverrides {
    /// Parse `-i HOST -l PORT -s HOST -p PORT -u --proxy METHOD` in any order.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut overrides = Self::default();
        let mut args = args.iter();

        while let Some(flag) = args.next() {
            let slot = match flag.as_str() {
                "-u" | "--udp" => {
                    overrides.udp = true;
                    continue;
                }
                "-i" | "--local-host" => &mut overrides.local_host,
                "-l" | "--local-port" => &mut overrides.local_port,
                "-s" | "--remote-host" => &mut overrides.remote_host,
                "-p" | "--remote-port" => &mut overrides.remote_port,
                "-proxy" | "--proxy" => &mut overrides.proxy_method,
                other => return Err(Error::config(format!("unknown option {}", other))),
            };
            let value = args
                .next()
                .ok_or_else(|| Error::config(format!("{} requires a value", flag)))?;
            *slot = Some(value.clone());
        }

        Ok(overrides)
    }
}

/// Where the local side listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConnConfig {
    pub local_addr: String,
    pub timeout: Duration,
}

/// How to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnConfig {
    pub remote_addr: String,
    pub num_conn: usize,
    pub transport: ClientTransport,
    /// `None` disables TCP keep-alive
    pub keep_alive: Option<Duration>,
}

/// Everything that goes into the hidden credential.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub uid: [u8; UID_LEN],
    pub session_id: u32,
    pub proxy_method: String,
    pub encryption_method: EncryptionMethod,
    pub unordered: bool,
    pub server_public_key: PublicKey,
    /// SNI presented in the ClientHello
    pub mock_domain: String,
}

/// Parse a config given either as a plugin string or as a path to a JSON file.
pub fn parse_config(conf: &str) -> Result<RawConfig> {
    if !(conf.contains(';') && conf.contains('=')) {
        return RawConfig::load(conf);
    }

    let value = ssv_to_json(conf)?;
    serde_json::from_value(value).map_err(|e| Error::config(format!("invalid client config: {}", e)))
}

/// Convert a semicolon-separated plugin string into a JSON object.
///
/// `\\`, `\=` and `\;` escape their second character. Parsing stops at the
/// first empty entry; entries without `=` are skipped.
pub fn ssv_to_json(ssv: &str) -> Result<Value> {
    let mut object = Map::new();

    for (key, value) in split_ssv(ssv) {
        let Some(value) = value else {
            tracing::warn!("Malformed config option: {}", key);
            continue;
        };

        let value = if UNQUOTED_KEYS.contains(&key.as_str()) {
            serde_json::from_str(&value)
                .map_err(|_| Error::config(format!("{} must be a literal, got {:?}", key, value)))?
        } else {
            Value::String(value)
        };
        object.insert(key, value);
    }

    Ok(Value::Object(object))
}

/// Split into `(key, value)` entries, resolving escapes.
fn split_ssv(ssv: &str) -> Vec<(String, Option<String>)> {
    let mut entries = Vec::new();
    let mut key = String::new();
    let mut value: Option<String> = None;
    let mut chars = ssv.chars();

    loop {
        let c = chars.next();
        match c {
            None | Some(';') => {
                if key.is_empty() && value.is_none() {
                    break;
                }
                entries.push((std::mem::take(&mut key), value.take()));
                if c.is_none() {
                    break;
                }
            }
            Some('=') if value.is_none() => value = Some(String::new()),
            Some(c) => {
                let c = if c == '\\' {
                    chars.next().unwrap_or('\\')
                } else {
                    c
                };
                match value.as_mut() {
                    Some(v) => v.push(c),
                    None => key.push(c),
                }
            }
        }
    }

    entries
}

impl RawConfig {
    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| Error::config(format!("invalid client config: {}", e)))
    }

    /// Standalone mode: set overrides win, then empty address fields get
    /// their defaults.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let fields = [
            (&mut self.local_host, &overrides.local_host),
            (&mut self.local_port, &overrides.local_port),
            (&mut self.remote_host, &overrides.remote_host),
            (&mut self.remote_port, &overrides.remote_port),
            (&mut self.proxy_method, &overrides.proxy_method),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                *field = value.clone();
            }
        }
        if overrides.udp {
            self.udp = true;
        }

        for (field, default) in [
            (&mut self.local_host, DEFAULT_LOCAL_HOST),
            (&mut self.local_port, DEFAULT_LOCAL_PORT),
            (&mut self.remote_port, DEFAULT_REMOTE_PORT),
        ] {
            if field.is_empty() {
                *field = default.to_string();
            }
        }
    }

    /// Shadowsocks plugin mode: non-empty config values win and `lookup`
    /// (normally the `SS_*` environment) only fills the gaps.
    pub fn fill_from_plugin_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (field, var) in [
            (&mut self.remote_host, "SS_REMOTE_HOST"),
            (&mut self.remote_port, "SS_REMOTE_PORT"),
            (&mut self.local_host, "SS_LOCAL_HOST"),
            (&mut self.local_port, "SS_LOCAL_PORT"),
        ] {
            if field.is_empty() {
                *field = lookup(var).unwrap_or_default();
            }
        }
        if self.proxy_method.is_empty() {
            self.proxy_method = "shadowsocks".to_string();
        }
    }

    /// Validate and split into local, remote and handshake settings.
    ///
    /// A fresh random session id is drawn for every call.
    pub fn split_configs(&self) -> Result<(LocalConnConfig, RemoteConnConfig, AuthInfo)> {
        let auth = self.auth_info()?;
        let remote = self.remote_conn_config()?;
        let local = self.local_conn_config()?;
        Ok((local, remote, auth))
    }

    fn auth_info(&self) -> Result<AuthInfo> {
        if self.server_name.is_empty() {
            return Err(cannot_be_empty("ServerName"));
        }
        if self.proxy_method.is_empty() {
            return Err(cannot_be_empty("ProxyMethod"));
        }
        if self.proxy_method.len() > PROXY_METHOD_LEN {
            return Err(Error::config(format!(
                "ProxyMethod must be at most {} bytes",
                PROXY_METHOD_LEN
            )));
        }
        if self.uid.is_empty() {
            return Err(cannot_be_empty("UID"));
        }
        let uid: [u8; UID_LEN] = self
            .uid
            .as_slice()
            .try_into()
            .map_err(|_| Error::config(format!("UID must be {} bytes", UID_LEN)))?;

        if self.public_key.is_empty() {
            return Err(cannot_be_empty("PublicKey"));
        }
        let server_public_key = PublicKey::from_slice(&self.public_key)
            .map_err(|_| Error::config("failed to unmarshal PublicKey"))?;

        let encryption_method = self.encryption_method.parse()?;

        Ok(AuthInfo {
            uid,
            session_id: SecureRandom::u32(),
            proxy_method: self.proxy_method.clone(),
            encryption_method,
            unordered: self.udp,
            server_public_key,
            mock_domain: self.server_name.clone(),
        })
    }

    fn remote_conn_config(&self) -> Result<RemoteConnConfig> {
        if self.remote_host.is_empty() {
            return Err(cannot_be_empty("RemoteHost"));
        }
        if self.remote_port.is_empty() {
            return Err(cannot_be_empty("RemotePort"));
        }
        if self.num_conn == 0 {
            return Err(cannot_be_empty("NumConn"));
        }
        let num_conn = usize::try_from(self.num_conn)
            .map_err(|_| Error::config(format!("NumConn must be positive, got {}", self.num_conn)))?;

        let transport = match self.transport.to_ascii_lowercase().as_str() {
            "cdn" => ClientTransport::WsOverTls {
                cdn_host: self.remote_host.clone(),
                path: if self.cdn_path.is_empty() {
                    "/".to_string()
                } else {
                    self.cdn_path.clone()
                },
            },
            // Anything else is direct, and any unknown browser is Chrome
            _ => ClientTransport::DirectTls {
                browser: self.browser_sig.parse().unwrap_or_default(),
            },
        };

        let keep_alive = if self.keep_alive <= 0 {
            None
        } else {
            Some(Duration::from_secs(self.keep_alive as u64))
        };

        Ok(RemoteConnConfig {
            remote_addr: join_host_port(&self.remote_host, &self.remote_port),
            num_conn,
            transport,
            keep_alive,
        })
    }

    fn local_conn_config(&self) -> Result<LocalConnConfig> {
        if self.local_host.is_empty() {
            return Err(cannot_be_empty("LocalHost"));
        }
        if self.local_port.is_empty() {
            return Err(cannot_be_empty("LocalPort"));
        }

        let timeout = match self.stream_timeout {
            0 => DEFAULT_STREAM_TIMEOUT,
            secs => Duration::from_secs(secs.unsigned_abs()),
        };

        Ok(LocalConnConfig {
            local_addr: join_host_port(&self.local_host, &self.local_port),
            timeout,
        })
    }
}

fn cannot_be_empty(field: &str) -> Error {
    Error::config(format!("{} cannot be empty", field))
}

/// `host:port`, bracketing IPv6 literals.
fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Serde helper for base64 byte strings.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;
    use crate::crypto::StaticSecret;
    use crate::disguise::Browser;

    fn raw() -> RawConfig {
        RawConfig {
            server_name: "www.bing.com".into(),
            proxy_method: "shadowsocks".into(),
            encryption_method: "aes-gcm".into(),
            uid: vec![7u8; UID_LEN],
            public_key: PublicKey::from(&StaticSecret::random()).to_bytes().to_vec(),
            num_conn: 4,
            local_host: "127.0.0.1".into(),
            local_port: "1984".into(),
            remote_host: "203.0.113.9".into(),
            remote_port: "443".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_defaults() {
        let (local, remote, auth) = raw().split_configs().unwrap();

        assert_eq!(local.local_addr, "127.0.0.1:1984");
        assert_eq!(local.timeout, DEFAULT_STREAM_TIMEOUT);
        assert_eq!(remote.remote_addr, "203.0.113.9:443");
        assert_eq!(remote.num_conn, 4);
        assert_eq!(remote.keep_alive, None);
        assert_eq!(
            remote.transport,
            ClientTransport::DirectTls {
                browser: Browser::Chrome
            }
        );
        assert_eq!(auth.mock_domain, "www.bing.com");
        assert_eq!(auth.encryption_method, EncryptionMethod::AesGcm);
        assert!(!auth.unordered);
    }

    #[test]
    fn test_split_options() {
        let mut config = raw();
        config.transport = "CDN".into();
        config.remote_host = "cdn.example.com".into();
        config.cdn_path = "/ws".into();
        config.keep_alive = 15;
        config.stream_timeout = 60;
        config.encryption_method = "ChaCha20-Poly1305".into();
        config.udp = true;

        let (local, remote, auth) = config.split_configs().unwrap();
        assert_eq!(local.timeout, Duration::from_secs(60));
        assert_eq!(remote.keep_alive, Some(Duration::from_secs(15)));
        assert_eq!(
            remote.transport,
            ClientTransport::WsOverTls {
                cdn_host: "cdn.example.com".into(),
                path: "/ws".into()
            }
        );
        assert_eq!(auth.encryption_method, EncryptionMethod::ChaCha20Poly1305);
        assert!(auth.unordered);

        let mut config = raw();
        config.browser_sig = "firefox".into();
        let (_, remote, _) = config.split_configs().unwrap();
        assert_eq!(
            remote.transport,
            ClientTransport::DirectTls {
                browser: Browser::Firefox
            }
        );
    }

    #[test]
    fn test_missing_fields() {
        let cases: [(&str, fn(&mut RawConfig)); 6] = [
            ("ServerName", |c| c.server_name.clear()),
            ("ProxyMethod", |c| c.proxy_method.clear()),
            ("UID", |c| c.uid.clear()),
            ("PublicKey", |c| c.public_key.clear()),
            ("NumConn", |c| c.num_conn = 0),
            ("LocalPort", |c| c.local_port.clear()),
        ];

        for (field, clear) in cases {
            let mut config = raw();
            clear(&mut config);
            let err = config.split_configs().unwrap_err();
            assert_eq!(err.to_string(), format!("configuration error: {} cannot be empty", field));
        }
    }

    #[test]
    fn test_bad_values() {
        let mut config = raw();
        config.encryption_method = "rot13".into();
        assert!(config.split_configs().is_err());

        let mut config = raw();
        config.uid = vec![1u8; 8];
        assert!(config.split_configs().is_err());

        let mut config = raw();
        config.public_key = vec![1u8; 31];
        assert!(config.split_configs().is_err());
    }

    #[test]
    fn test_ipv6_join() {
        assert_eq!(join_host_port("::1", "443"), "[::1]:443");
        assert_eq!(join_host_port("example.com", "443"), "example.com:443");
    }

    #[test]
    fn test_ssv_to_json() {
        let json = ssv_to_json(r"ServerName=www.bing.com;NumConn=4;UDP=true;ProxyMethod=a\=b\;c\\").unwrap();

        assert_eq!(json["ServerName"], "www.bing.com");
        assert_eq!(json["NumConn"], 4);
        assert_eq!(json["UDP"], true);
        assert_eq!(json["ProxyMethod"], r"a=b;c\");
    }

    #[test]
    fn test_ssv_stops_at_empty_entry() {
        let json = ssv_to_json("ServerName=a;;ProxyMethod=b").unwrap();
        assert_eq!(json["ServerName"], "a");
        assert!(json.get("ProxyMethod").is_none());

        let json = ssv_to_json("Junk;ServerName=a;").unwrap();
        assert_eq!(json.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_ssv_bad_literal() {
        assert!(ssv_to_json("NumConn=four;").is_err());
    }

    #[test]
    fn test_parse_plugin_string() {
        let public = PublicKey::from(&StaticSecret::random());
        let ssv = format!(
            "ServerName=www.bing.com;ProxyMethod=shadowsocks;EncryptionMethod=plain;\
             UID={};PublicKey={};NumConn=2;LocalHost=127.0.0.1;LocalPort=1984;\
             RemoteHost=203.0.113.9;RemotePort=443;KeepAlive=-1",
            STANDARD.encode([9u8; UID_LEN]),
            STANDARD.encode(public.as_bytes())
        );

        let config = parse_config(&ssv).unwrap();
        assert_eq!(config.uid, vec![9u8; UID_LEN]);
        assert_eq!(config.keep_alive, -1);

        let (_, remote, auth) = config.split_configs().unwrap();
        assert_eq!(remote.num_conn, 2);
        assert_eq!(auth.server_public_key.as_bytes(), public.as_bytes());
        assert_eq!(auth.encryption_method, EncryptionMethod::Plain);
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(raw()).unwrap();
        for key in ["ServerName", "UID", "PublicKey", "NumConn", "UDP", "CDNPath", "KeepAlive"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }

        let back: RawConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.uid, vec![7u8; UID_LEN]);
    }

    #[test]
    fn test_plugin_env_fills_only_empty_fields() {
        let mut config = RawConfig {
            remote_host: "203.0.113.9".into(),
            local_port: "2000".into(),
            ..Default::default()
        };
        config.fill_from_plugin_env(|var| match var {
            "SS_REMOTE_HOST" => Some("198.51.100.1".into()),
            "SS_REMOTE_PORT" => Some("8443".into()),
            "SS_LOCAL_HOST" => Some("127.0.0.2".into()),
            "SS_LOCAL_PORT" => Some("3000".into()),
            _ => None,
        });

        assert_eq!(config.remote_host, "203.0.113.9");
        assert_eq!(config.local_port, "2000");
        assert_eq!(config.remote_port, "8443");
        assert_eq!(config.local_host, "127.0.0.2");
        assert_eq!(config.proxy_method, "shadowsocks");
    }

    #[test]
    fn test_command_line_overrides() {
        let args: Vec<String> = ["-s", "192.0.2.7", "-l", "5000", "-u", "--proxy", "openvpn"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let overrides = ConfigOverrides::parse(&args).unwrap();
        assert!(overrides.udp);
        assert_eq!(overrides.remote_host.as_deref(), Some("192.0.2.7"));

        let mut config = RawConfig {
            remote_host: "203.0.113.9".into(),
            proxy_method: "shadowsocks".into(),
            ..Default::default()
        };
        config.apply_overrides(&overrides);

        assert_eq!(config.remote_host, "192.0.2.7");
        assert_eq!(config.local_port, "5000");
        assert_eq!(config.proxy_method, "openvpn");
        assert!(config.udp);
        // Unset and empty, so the defaults apply
        assert_eq!(config.local_host, DEFAULT_LOCAL_HOST);
        assert_eq!(config.remote_port, DEFAULT_REMOTE_PORT);
    }

    #[test]
    fn test_bad_command_line() {
        let missing = vec!["-p".to_string()];
        assert!(ConfigOverrides::parse(&missing).is_err());

        let unknown = vec!["-x".to_string(), "1".to_string()];
        assert!(ConfigOverrides::parse(&unknown).is_err());
    }

    #[test]
    fn test_parse_missing_file() {
        assert!(matches!(
            parse_config("/nonexistent/ckclient.json"),
            Err(Error::Config(_))
        ));
    }
}
