//! Keel store - serve a local directory as a collection store
//!
//! Usage:
//!   keel-store <root> --secret-file <file>
//!
//! Clients log in with the same secret in their credential file and pin the
//! certificate fingerprint printed at startup (`network.cert_fingerprint`).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use keel_core::Config;
use keel_driver::{StoreHost, StoreHostConfig};

#[derive(Parser)]
#[command(name = "keel-store")]
#[command(about = "Serve a directory as a Keel collection store", long_about = None)]
struct Cli {
    /// Directory to serve (default: store.root from the config)
    root: Option<PathBuf>,

    /// Address to listen on (default: store.bind and store.port)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// File holding the shared login secret
    #[arg(short, long)]
    secret_file: Option<PathBuf>,

    /// Host name announced to clients
    #[arg(short, long)]
    name: Option<String>,

    /// Config file (default: platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path).with_context(|| format!("loading {:?}", path))?,
        None => Config::load(),
    };

    let Some(root) = cli.root.or_else(|| config.store.root.clone()) else {
        bail!("no directory to serve; pass one or set store.root");
    };
    let Some(secret_file) = cli.secret_file.or_else(|| config.store.secret_file.clone()) else {
        bail!("no secret file; pass --secret-file or set store.secret_file");
    };

    let mut secret = std::fs::read(&secret_file).with_context(|| format!("reading {:?}", secret_file))?;
    let end = secret
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    secret.truncate(end);
    if secret.is_empty() {
        bail!("secret file {:?} is empty", secret_file);
    }

    let mut host_config = StoreHostConfig::from_config(&config, root, secret);
    if let Some(bind) = cli.bind {
        host_config.bind_addr = bind;
    }
    if let Some(name) = cli.name {
        host_config.host_name = name;
    }

    let host = StoreHost::bind(host_config)?;

    info!("Starting Keel store...");
    info!("  Listening on: {}", host.local_addr()?);
    info!("  Certificate fingerprint: {}", hex::encode(host.fingerprint()));
    info!("");
    info!("  Pin it in the client config:");
    info!("    [network]");
    info!("    cert_fingerprint = \"{}\"", hex::encode(host.fingerprint()));

    tokio::select! {
        result = host.serve() => {
            if let Err(e) = result {
                error!("store error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
            host.shutdown();
        }
    }

    Ok(())
}
