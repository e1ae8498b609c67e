//! # Relay Server Binary
//!
//! Runs the relay with an operator console on stdin.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cipherlink::config::load_server_config;
use cipherlink::{
    CipherMode, Console, CryptoEngine, KeyExchange, KeyStore, RelayServer, ServerConfig,
};
use colored::Colorize;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Environment variable consulted when no passphrase flag is given
const PASSPHRASE_ENV: &str = "CIPHERLINK_PASSPHRASE";

/// Encrypted relay server
#[derive(Parser)]
#[command(name = "cipherlink-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,

    /// Cipher for the RSA key exchange (aes_128_cbc, aes_192_cbc, aes_256_cbc)
    #[arg(long)]
    cipher: Option<CipherMode>,

    /// Derive session keys with Diffie-Hellman instead of sending them
    #[arg(long)]
    dh: bool,

    /// RSA modulus size for a newly generated identity
    #[arg(long)]
    rsa_bits: Option<usize>,

    /// Key store directory (default: ~/.cipherlink)
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Passphrase protecting the stored key pair
    #[arg(long)]
    passphrase: Option<String>,

    /// Use a throwaway identity and leave the key store alone
    #[arg(long)]
    ephemeral: bool,
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")
}

fn build_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => load_server_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(cipher) = cli.cipher {
        config.cipher = cipher;
    }
    if cli.dh {
        config.key_exchange = KeyExchange::DiffieHellman;
    }
    if let Some(bits) = cli.rsa_bits {
        config.rsa_bits = bits;
    }
    if let Some(dir) = &cli.keystore {
        config.keystore_dir = Some(dir.clone());
    }
    Ok(config)
}

fn load_identity(cli: &Cli, config: &ServerConfig) -> Result<CryptoEngine> {
    let mut engine = CryptoEngine::new();

    if cli.ephemeral {
        info!("Generating ephemeral {} bit identity", config.rsa_bits);
        engine
            .generate_key_pair(config.rsa_bits)
            .context("Failed to generate RSA key pair")?;
        return Ok(engine);
    }

    let store = match &config.keystore_dir {
        Some(dir) => KeyStore::new(dir),
        None => KeyStore::default_location()?,
    };
    let passphrase = cli
        .passphrase
        .clone()
        .or_else(|| std::env::var(PASSPHRASE_ENV).ok());
    if passphrase.is_none() {
        warn!("No passphrase given, the stored key pair is not encrypted");
    }

    store
        .load_or_generate(&mut engine, config.rsa_bits, passphrase.as_deref())
        .with_context(|| format!("Failed to load identity from {}", store.dir().display()))?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = build_config(&cli)?;
    let identity = load_identity(&cli, &config)?;
    println!(
        "{} {}",
        "Server fingerprint:".bold(),
        identity.local_fingerprint()?.cyan()
    );

    let server = RelayServer::bind(&config, identity.local_key_pair()?.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let stop_tx = Arc::clone(&shutdown_tx);
    let console = Console::new(
        server.registry(),
        Box::new(move || {
            stop_tx.send_replace(true);
        }),
    );
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = console.run(stdin, std::io::stdout()).await {
            warn!("Console failed: {}", e);
        }
    });

    let ctrl_c_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            ctrl_c_tx.send_replace(true);
        }
    });

    server.run(shutdown_rx).await?;

    // The blocking stdin read cannot be cancelled; do not wait for it
    std::process::exit(0);
}
