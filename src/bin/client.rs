//! Cloak Client Binary
//!
//! Usage: ck-client [OPTIONS] [OVERRIDES]
//!
//! Options:
//!   -c, --config <CONFIG>  Open the connection pool described by a config
//!   -t, --test <CONFIG>    Perform one test handshake
//!   -h, --help             Print help information
//!
//! `<CONFIG>` is a path to a JSON file or a `key=value;...` plugin string.
//! Overrides (`-i`, `-l`, `-s`, `-p`, `-u`, `--proxy`) replace config values.
//! When started as a Shadowsocks plugin (`SS_LOCAL_HOST` set) the options
//! come from `SS_PLUGIN_OPTIONS` and the environment fills in empty addresses.

use std::env;
use std::time::{Duration, Instant};

use futures::future::join_all;

use cloak::client::{self, parse_config, ConfigOverrides, RawConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if env::var("SS_LOCAL_HOST").is_ok() {
        let config = plugin_config()?;
        return run_client(config).await;
    }

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-t" | "--test" => {
            if args.len() < 3 {
                eprintln!("Error: --test requires a config file path or plugin string");
                return Ok(());
            }
            test_connection(standalone_config(&args[2], &args[3..])?).await?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a config file path or plugin string");
                return Ok(());
            }
            run_client(standalone_config(&args[2], &args[3..])?).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Cloak Client - obfuscated proxy front end

USAGE:
    ck-client [OPTIONS]

OPTIONS:
    -c, --config <CONFIG>  Open the connection pool described by a config
    -t, --test <CONFIG>    Perform one test handshake
    -h, --help             Print help information

OVERRIDES (after the config):
    -i <HOST>              Local listen address [default: 127.0.0.1]
    -l <PORT>              Local listen port [default: 1984]
    -s <HOST>              Remote server address
    -p <PORT>              Remote server port [default: 443]
    -u                     The proxied protocol uses UDP
    --proxy <METHOD>       Proxy method, as named in the server's ProxyBook

CONFIGURATION FILE FORMAT (JSON):
    {{
        "ServerName": "www.bing.com",
        "ProxyMethod": "shadowsocks",
        "EncryptionMethod": "aes-gcm",
        "UID": "<base64>",
        "PublicKey": "<base64>",
        "NumConn": 4,
        "LocalHost": "127.0.0.1",
        "LocalPort": "1984",
        "RemoteHost": "server.example.com",
        "RemotePort": "443",
        "BrowserSig": "chrome",
        "Transport": "direct"
    }}

EXAMPLES:
    Test a handshake:
        ck-client --test ckclient.json

    Same, with a plugin string:
        ck-client --test "ServerName=www.bing.com;ProxyMethod=shadowsocks;..."

    Open connections to another server:
        ck-client --config ckclient.json -s 203.0.113.9 -p 8443
"#
    );
}

/// Config for Shadowsocks plugin mode.
///
/// Values in the plugin options win; the `SS_*` variables only fill
/// addresses the options leave empty.
fn plugin_config() -> anyhow::Result<RawConfig> {
    let options = env::var("SS_PLUGIN_OPTIONS").unwrap_or_default();
    let mut config = if options.is_empty() {
        RawConfig::default()
    } else {
        // A single option has no ';', so terminate it to keep it a plugin string.
        parse_config(&format!("{};", options.trim_end_matches(';')))?
    };

    config.fill_from_plugin_env(|var| env::var(var).ok());
    Ok(config)
}

/// Config for standalone mode, with command-line overrides applied.
fn standalone_config(conf: &str, overrides: &[String]) -> anyhow::Result<RawConfig> {
    let overrides = ConfigOverrides::parse(overrides)?;
    let mut config = parse_config(conf)?;
    config.apply_overrides(&overrides);
    Ok(config)
}

async fn test_connection(config: RawConfig) -> anyhow::Result<()> {
    let (_, remote, auth) = config.split_configs()?;

    tracing::info!("Testing handshake with {}", remote.remote_addr);
    tracing::info!("Mock domain: {}", auth.mock_domain);

    let started = Instant::now();
    match client::connect(&remote, &auth).await {
        Ok((mut conn, _session_key)) => {
            tracing::info!(
                "Handshake completed in {} ms ({} framing)",
                started.elapsed().as_millis(),
                conn.transport()
            );

            // The server hands the connection on; anything it sends is logged.
            match tokio::time::timeout(Duration::from_secs(5), conn.read_unit()).await {
                Ok(Ok(Some(data))) => tracing::info!("Received {} bytes", data.len()),
                Ok(Ok(None)) => tracing::info!("Server closed the connection"),
                Ok(Err(e)) => tracing::warn!("Receive error: {}", e),
                Err(_) => tracing::info!("No data within timeout (this is normal)"),
            }

            conn.close().await?;
            tracing::info!("Connection closed successfully");
        }
        Err(e) => {
            tracing::error!("Handshake failed: {}", e);
        }
    }

    Ok(())
}

async fn run_client(config: RawConfig) -> anyhow::Result<()> {
    let (local, remote, auth) = config.split_configs()?;

    tracing::info!(
        "Opening {} connections to {} for session {}",
        remote.num_conn,
        remote.remote_addr,
        auth.session_id
    );
    tracing::info!("Local streams time out after {:?}", local.timeout);

    let attempts = (0..remote.num_conn).map(|_| client::connect(&remote, &auth));
    let mut conns = Vec::with_capacity(remote.num_conn);
    for (i, result) in join_all(attempts).await.into_iter().enumerate() {
        match result {
            Ok((conn, _)) => conns.push(conn),
            Err(e) => tracing::warn!("Connection {} failed: {}", i, e),
        }
    }

    if conns.is_empty() {
        anyhow::bail!("no connection to {} could be established", remote.remote_addr);
    }
    tracing::info!("{}/{} connections ready. Ctrl+C to exit.", conns.len(), remote.num_conn);

    tokio::signal::ctrl_c().await?;

    for conn in conns {
        if let Err(e) = conn.close().await {
            tracing::debug!("Close error: {}", e);
        }
    }
    Ok(())
}
