//! Cloak Server Binary
//!
//! Usage: ck-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate new server configuration
//!   -u, --uid <FILE>     Add a new client UID to a configuration file
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};

use cloak::server::{ChannelHandoff, Handoff, Server, ServerConfig, ServerConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config(args.get(2).map(String::as_str))?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        "--show-pubkey" => {
            if args.len() < 3 {
                eprintln!("Error: --show-pubkey requires a config file path");
                return Ok(());
            }
            show_pubkey(&args[2])?;
        }
        "-u" | "--uid" => {
            if args.len() < 3 {
                eprintln!("Error: --uid requires a config file path");
                return Ok(());
            }
            add_uid(&args[2])?;
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
        r#"Cloak Server - obfuscated proxy front end

USAGE:
    ck-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>       Path to configuration file
    -g, --generate [DECOY]    Generate new server configuration
    --show-pubkey <FILE>      Show server public key and UIDs
    -u, --uid <FILE>          Generate a new client UID and update config
    -h, --help                Print help information

EXAMPLES:
    Generate a new configuration with a decoy web server:
        ck-server --generate 127.0.0.1:8080 > ckserver.toml

    Run the server:
        ck-server --config ckserver.toml

    Add a new client:
        ck-server --uid ckserver.toml
"#
    );
}

fn generate_config(redirect_addr: Option<&str>) -> anyhow::Result<()> {
    let mut config = ServerConfig::new_random("0.0.0.0:443", redirect_addr.map(str::to_string));
    config.add_proxy("shadowsocks", "127.0.0.1:8388");
    let uid = config.generate_uid();
    let public_key = config.public_key();

    let config_file = ServerConfigFile::from_config(&config);

    println!("# Cloak Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config_file.to_toml()?);
    println!();
    println!("# Client connection info (put these in ckclient.json):");
    println!("# PublicKey: {}", STANDARD.encode(public_key.as_bytes()));
    println!("# UID:       {}", STANDARD.encode(uid));

    Ok(())
}

fn show_pubkey(config_path: &str) -> anyhow::Result<()> {
    let config = ServerConfigFile::load(config_path)?.to_config()?;
    let public_key = config.public_key();

    println!("Server Public Key (base64): {}", STANDARD.encode(public_key.as_bytes()));
    println!("Server Public Key (hex):    {}", hex::encode(public_key.as_bytes()));
    println!();
    println!("Allowed UIDs:");
    for (i, uid) in config.bypass_uids.iter().enumerate() {
        println!("  [{}] {} ({})", i + 1, STANDARD.encode(uid), hex::encode(uid));
    }

    Ok(())
}

fn add_uid(config_path: &str) -> anyhow::Result<()> {
    let mut config = ServerConfigFile::load(config_path)?.to_config()?;
    let uid = config.generate_uid();

    let mut output = String::new();
    output.push_str("# Cloak Server Configuration\n\n");
    output.push_str(&ServerConfigFile::from_config(&config).to_toml()?);
    std::fs::write(config_path, &output)?;

    let public_key = config.public_key();
    let proxy_method = config
        .proxy_book
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "shadowsocks".to_string());

    println!("New client added successfully!");
    println!();
    println!("Give your friend this ckclient.json:");
    println!();
    let client = serde_json::json!({
        "ServerName": "www.bing.com",
        "ProxyMethod": proxy_method,
        "EncryptionMethod": "aes-gcm",
        "UID": STANDARD.encode(uid),
        "PublicKey": STANDARD.encode(public_key.as_bytes()),
        "NumConn": 4,
        "LocalHost": "127.0.0.1",
        "LocalPort": "1984",
        "RemoteHost": "YOUR_SERVER_IP",
        "RemotePort": "443",
        "BrowserSig": "chrome",
        "Transport": "direct",
    });
    println!("{}", serde_json::to_string_pretty(&client)?);

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = ServerConfigFile::load(config_path)?.to_config()?;
    config.validate()?;

    tracing::info!("Starting Cloak server on {}", config.listen_addr);
    match &config.redirect_addr {
        Some(addr) => tracing::info!("Redirecting unrecognised traffic to {}", addr),
        None => tracing::info!("No redirect address, unrecognised traffic will be dropped"),
    }
    tracing::info!("Proxy methods: {}", config.proxy_book.len());
    tracing::info!("Allowed UIDs: {}", config.bypass_uids.len());

    let (handoff, mut sessions) = ChannelHandoff::channel(64);
    let server = Server::new(config, Arc::new(handoff));

    // No session layer is linked into this binary, so each handoff is logged
    // and closed.
    tokio::spawn(async move {
        while let Some(handoff) = sessions.recv().await {
            log_handoff(handoff).await;
        }
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            println!("{}", server.metrics().format_report());
        }
    }

    Ok(())
}

async fn log_handoff(handoff: Handoff) {
    let cipher = match handoff.payload_cipher() {
        Ok(Some(_)) => "encrypted",
        Ok(None) => "plain",
        Err(e) => {
            tracing::warn!("Dropping session from {}: {}", handoff.peer, e);
            return;
        }
    };

    tracing::info!(
        "Session {} from {}: method {}, {} payload, record framing {}",
        handoff.metadata.session_id,
        handoff.peer,
        handoff.metadata.proxy_method,
        cipher,
        handoff.record_framing()
    );

    if let Err(e) = handoff.conn.close().await {
        tracing::debug!("Close error: {}", e);
    }
}
