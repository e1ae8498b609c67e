//! # Chat Client Binary
//!
//! Connects to a relay and sends stdin lines of the form `<nick> <message>`.
//! `/quit` or end of input leaves the relay.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cipherlink::config::load_client_config;
use cipherlink::{ChatClient, ClientConfig, CryptoEngine, Inbox, KeyExchange, KeyStore, RelayMessage};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

const PASSPHRASE_ENV: &str = "CIPHERLINK_PASSPHRASE";

/// Encrypted relay chat client
#[derive(Parser)]
#[command(name = "cipherlink-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server address
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Nickname to register
    #[arg(short, long)]
    nick: Option<String>,

    /// Use the Diffie-Hellman key exchange (the server must too)
    #[arg(long)]
    dh: bool,

    /// RSA modulus size for a newly generated key pair
    #[arg(long)]
    rsa_bits: Option<usize>,

    /// Key store directory (default: ~/.cipherlink)
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Passphrase protecting the stored key pair
    #[arg(long)]
    passphrase: Option<String>,

    /// Use a throwaway key pair and leave the key store alone
    #[arg(long)]
    ephemeral: bool,
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => load_client_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(nick) = &cli.nick {
        config.nickname = nick.clone();
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

fn load_key_pair(cli: &Cli, config: &ClientConfig) -> Result<CryptoEngine> {
    let mut engine = CryptoEngine::new();

    if cli.ephemeral {
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

    let generated = store
        .load_or_generate(&mut engine, config.rsa_bits, passphrase.as_deref())
        .with_context(|| format!("Failed to load key pair from {}", store.dir().display()))?;
    if generated {
        info!("New key pair saved to {}", store.dir().display());
    }
    Ok(engine)
}

async fn print_incoming(mut inbox: Inbox) {
    loop {
        match inbox.recv().await {
            Ok(RelayMessage::Deliver { from, payload }) => {
                println!("[{}] {}", from.green(), String::from_utf8_lossy(&payload));
            }
            Ok(RelayMessage::Error { reason }) => println!("{}", reason.red()),
            Ok(other) => debug!("Ignoring {:?}", other),
            Err(e) => {
                println!("{} {}", "Disconnected:".red(), e);
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = build_config(&cli)?;
    let engine = load_key_pair(&cli, &config)?;
    let local_fingerprint = engine.local_fingerprint()?;

    let client = ChatClient::connect(&config, engine)
        .await
        .with_context(|| format!("Failed to join {}", config.server))?;

    println!("{} {}", "Your fingerprint:  ".bold(), local_fingerprint.cyan());
    println!("{} {}", "Server fingerprint:".bold(), client.server_fingerprint().cyan());
    println!("Registered as {}. Type `<nick> <message>`, /quit to leave.", client.nickname().green());

    let (inbox, mut outbox) = client.split()?;
    let receiver = tokio::spawn(print_incoming(inbox));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let Some((nick, message)) = line.split_once(char::is_whitespace) else {
            println!("{}", "Usage: <nick> <message>".yellow());
            continue;
        };
        if receiver.is_finished() {
            break;
        }
        outbox
            .send_to(nick, message.trim_start().as_bytes())
            .await
            .context("Failed to send message")?;
    }

    outbox.end().await.ok();
    receiver.abort();
    Ok(())
}
