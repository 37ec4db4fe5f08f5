//! Peer-to-peer chat CLI
//!
//! Usage:
//!   peerchat relay [--listen 127.0.0.1:8765]
//!   peerchat chat [--relay <url>] [--peer <id>] [--id <id>]
//!   peerchat demo
//!   peerchat config [--path]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerchat::PeerId;
use peerchat_cli::{demo, ChatOptions, RelayServer};
use peerchat_config::{get_config_path, Config};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerchat")]
#[command(about = "Random peer-to-peer chat over WebRTC", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a WebSocket signaling relay
    Relay {
        #[arg(long, default_value = "127.0.0.1:8765")]
        listen: String,
    },
    /// Chat with a random or specific peer
    Chat {
        /// Relay URL, defaults to the configured one
        #[arg(long)]
        relay: Option<String>,
        /// Peer to connect to directly
        #[arg(long)]
        peer: Option<String>,
        /// Our own peer id, generated if omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Two in-process peers chatting over a mock network
    Demo,
    /// Show the resolved configuration
    Config {
        /// Only print the config file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "peerchat=debug,peerchat_cli=debug" } else { "peerchat=info,peerchat_cli=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Relay { listen } => {
            let server = RelayServer::bind(&listen).await?;
            println!("Signaling relay on ws://{}", server.local_addr()?);
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => println!("Shutting down"),
            }
        }
        Commands::Chat { relay, peer, id } => {
            let config = Config::load_or_default();
            let opts = ChatOptions {
                relay_url: relay.unwrap_or_else(|| config.signaling.relay_url.clone()),
                peer: peer.map(PeerId::new),
                id: id.map(PeerId::new),
                stun_servers: config.signaling.stun_servers.clone(),
                session: config.session_config(),
            };
            peerchat_cli::chat::run(opts).await?;
        }
        Commands::Demo => {
            demo::run(demo::fast_config()).await?;
        }
        Commands::Config { path } => {
            let config_path = get_config_path();
            if path {
                println!("{}", config_path.display());
            } else {
                let config = Config::load().context("Failed to load config")?;
                println!("# {}", config_path.display());
                print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
            }
        }
    }

    Ok(())
}
