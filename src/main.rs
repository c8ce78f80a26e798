//! CLI entry point for peerlink.
//!
//! Manages the local identity and configuration, decodes captured frames and
//! runs an in-process loopback demo of the session layer.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::info;
use peerlink::{
    app::{load_or_create_local_peer, save_local_peer, PROFILE_FILE},
    crypto::LocalPeer,
    session::{SessionEvent, SessionManager, Subscription},
    transport::{ConnectionStatus, DeserializerEvent, LoopbackNetwork, MessageDeserializer},
    utils::{PeerlinkConfig, DEFAULT_CONFIG_FILE},
    App, Message,
};
use serde_json::Map;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Peerlink - session layer for small-MTU peer-to-peer links
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Identity handshake, chunked messaging and multi-transport routing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and spooled bodies
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect the identity key
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Show the local peer profile
    Profile {
        /// Display format (json, pretty)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Exchange a message between two in-process peers
    Demo {
        /// MTU of the loopback link
        #[arg(short, long, default_value_t = peerlink::defaults::DEFAULT_MTU)]
        mtu: usize,
        /// Payload size in bytes
        #[arg(short, long, default_value = "4096")]
        size: usize,
    },
    /// Decode a file of captured wire bytes
    Decode {
        /// File holding one or more encoded messages
        file: PathBuf,
        /// Feed the decoder this many bytes at a time
        #[arg(short = 'n', long, default_value_t = peerlink::defaults::DEFAULT_MTU)]
        chunk: usize,
    },
    /// Run the session manager until interrupted
    Run,
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity key pair
    Generate {
        /// Alias for the identity
        #[arg(short, long)]
        alias: Option<String>,
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the current public key
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PeerlinkConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.set_data_dir(data_dir);
    }

    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;
    config.ensure_directories()?;

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Profile { format } => handle_profile_command(&format, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Demo { mtu, size } => handle_demo_command(mtu, size, &config),
        Commands::Decode { file, chunk } => handle_decode_command(&file, chunk, &config),
        Commands::Run => App::new(config).await?.run().await.map_err(Into::into),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

fn handle_key_commands(action: KeyCommands, config: &PeerlinkConfig) -> Result<()> {
    match action {
        KeyCommands::Generate { alias, force } => {
            let keys_dir = &config.storage.keys_dir;
            let profile_path = keys_dir.join(PROFILE_FILE);

            if profile_path.exists() && !force {
                return Err(anyhow::anyhow!(
                    "Identity already exists. Use --force to overwrite."
                ));
            }

            let alias = alias.unwrap_or_else(|| config.identity.alias.clone());
            info!("Generating new identity for '{}'", alias);
            let local = LocalPeer::generate(alias);
            save_local_peer(&local, keys_dir)?;

            println!("✓ Identity generated successfully");
            println!("  Alias: {}", local.alias());
            println!("  Fingerprint: {}", local.peer().fingerprint());
            println!("  Saved to: {}", profile_path.display());
        }
        KeyCommands::Show { format } => {
            let local = load_or_create_local_peer(config)?;
            match format.as_str() {
                "hex" => println!("{}", hex::encode(local.public_key())),
                "base64" => println!("{}", general_purpose::STANDARD.encode(local.public_key())),
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
    }
    Ok(())
}

fn handle_profile_command(format: &str, config: &PeerlinkConfig) -> Result<()> {
    let local = load_or_create_local_peer(config)?;
    let peer = local.peer();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(peer)?),
        "pretty" => {
            println!("Local Peer");
            println!("==========");
            println!("Alias: {}", peer.alias());
            println!("Fingerprint: {}", peer.fingerprint());
            println!("Public Key: {}", hex::encode(peer.public_key()));
        }
        _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
    }

    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &PeerlinkConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            PeerlinkConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            match file {
                Some(path) => PeerlinkConfig::from_file(path)?,
                None => config.clone(),
            }
            .validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => println!("{}", config.to_toml_string()?),
    }
    Ok(())
}

fn handle_demo_command(mtu: usize, size: usize, config: &PeerlinkConfig) -> Result<()> {
    let session = config.session_config();
    let alice = SessionManager::new(LocalPeer::generate("alice"), session.clone());
    let bob = SessionManager::new(LocalPeer::generate("bob"), session);

    let network = LoopbackNetwork::new();
    let alice_link = network.endpoint("alice", "loopback", 1, mtu);
    let bob_link = network.endpoint("bob", "loopback", 1, mtu);
    alice.register_transport(alice_link.clone());
    bob.register_transport(bob_link.clone());

    alice.subscribe(Arc::new(|event: &SessionEvent| {
        match event {
            SessionEvent::MessageSending { progress, .. } => {
                println!("  alice: sent {:>5.1}%", progress * 100.0);
            }
            SessionEvent::MessageSent { .. } => println!("✓ alice: {}", event),
            _ => {}
        }
        Subscription::Keep
    }));
    bob.subscribe(Arc::new(|event: &SessionEvent| {
        match event {
            SessionEvent::PeerStatusUpdated {
                status: ConnectionStatus::Connected,
                ..
            } => println!("✓ bob: {}", event),
            SessionEvent::MessageReceived { .. } => println!("✓ bob: {}", event),
            _ => {}
        }
        Subscription::Keep
    }));

    network.connect(&alice_link, &bob_link);
    network.run_until_idle();

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let message = Arc::new(Message::data(payload, Map::new()));
    alice.send_message(message, bob.local_peer().peer())?;
    let deliveries = network.run_until_idle();

    println!("Demo complete");
    println!("  MTU: {}", mtu);
    println!("  Chunks delivered: {}", deliveries);
    println!("  Bytes on the wire: {}", alice_link.bytes_sent());
    Ok(())
}

fn handle_decode_command(file: &Path, chunk: usize, config: &PeerlinkConfig) -> Result<()> {
    if chunk == 0 {
        return Err(anyhow::anyhow!("Chunk size must be positive"));
    }

    let bytes = std::fs::read(file)?;
    let mut deserializer = MessageDeserializer::new(&config.session_config());
    let mut decoded = 0usize;

    for piece in bytes.chunks(chunk) {
        for event in deserializer.receive(piece) {
            match event {
                DeserializerEvent::HeaderReady(header) => {
                    println!("Header: {}", String::from_utf8_lossy(&header.encode()?));
                }
                DeserializerEvent::BodyProgress { id, progress } => {
                    println!("  {}: {:>5.1}%", id, progress * 100.0);
                }
                DeserializerEvent::Complete(Ok(message)) => {
                    decoded += 1;
                    println!("✓ {}", message);
                }
                DeserializerEvent::Complete(Err(err)) => println!("✗ {}", err),
            }
        }
    }

    println!("Decoded {} message(s), decoder left in {:?}", decoded, deserializer.phase());
    Ok(())
}
