//! Keel CLI - operate on remote collection stores
//!
//! Usage:
//!   keel stat <host> <path>            Show attributes
//!   keel ls <host> <path>              List a collection
//!   keel get <host> <path> <file>      Copy a data object to a local file
//!   keel put <host> <path> <file>      Copy a local file to a data object
//!
//! `<host>` is `name[:port]`; the port defaults to `driver.default_port`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use keel_core::{Config, HostKey, OpenFlags};
use keel_driver::{MemoryBackend, RemoteBackend, RemoteDriver, StoreBackend};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Reliable remote collection-store client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run against an in-process memory store
    #[arg(long, global = true)]
    memory: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show attributes of a path
    Stat { host: String, path: String },

    /// List a collection
    Ls { host: String, path: String },

    /// Print a data object
    Cat { host: String, path: String },

    /// Copy a data object to a local file
    Get {
        host: String,
        path: String,
        file: PathBuf,
    },

    /// Copy a local file to a data object
    Put {
        host: String,
        path: String,
        file: PathBuf,
    },

    /// Remove a data object
    Rm { host: String, path: String },

    /// Create a collection
    Mkdir {
        host: String,
        path: String,

        /// Permission bits
        #[arg(short, long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },

    /// Remove an empty collection
    Rmdir { host: String, path: String },

    /// Rename, replacing an existing target
    Mv {
        host: String,
        from: String,
        to: String,
    },

    /// Set the size of a data object
    Truncate {
        host: String,
        path: String,
        size: u64,
    },

    /// Print the content digest of a data object
    Sum { host: String, path: String },

    /// Show filesystem capacity
    Df {
        host: String,
        #[arg(default_value = "/")]
        path: String,
    },
}

fn parse_mode(text: &str) -> Result<u32, String> {
    u32::from_str_radix(text, 8).map_err(|e| format!("invalid octal mode: {}", e))
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

    let backend: Arc<dyn RemoteBackend> = if cli.memory {
        info!("using an in-process memory store");
        Arc::new(MemoryBackend::new().with_credentials_required(false))
    } else {
        Arc::new(StoreBackend::new(&config))
    };
    let driver = RemoteDriver::new(backend, &config.driver);

    let interrupt = driver.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let result = run(&driver, cli.command).await;
    driver.shutdown().await;
    result
}

async fn run(driver: &RemoteDriver, command: Commands) -> Result<()> {
    match command {
        Commands::Stat { host, path } => {
            let stat = driver.stat(&driver.host_key(&host), &path).await.with_context(|| path.clone())?;
            let kind = if stat.is_dir() { "collection" } else { "data object" };
            println!("{}: {}", path, kind);
            println!("  size:  {}", stat.size);
            println!("  inode: {}", stat.ino);
            println!("  mode:  {:o}", stat.mode);
            println!("  mtime: {}", format_time(stat.mtime));
            println!("  ctime: {}", format_time(stat.ctime));
        }
        Commands::Ls { host, path } => {
            let names = driver.list(&driver.host_key(&host), &path).await.with_context(|| path.clone())?;
            for name in names {
                println!("{}", name);
            }
        }
        Commands::Cat { host, path } => {
            cat(driver, &driver.host_key(&host), &path).await.with_context(|| path.clone())?;
        }
        Commands::Get { host, path, file } => {
            let bytes = driver
                .get_file(&driver.host_key(&host), &path, &file)
                .await
                .with_context(|| format!("{} -> {:?}", path, file))?;
            println!("{} bytes", bytes);
        }
        Commands::Put { host, path, file } => {
            let bytes = driver
                .put_file(&driver.host_key(&host), &path, &file)
                .await
                .with_context(|| format!("{:?} -> {}", file, path))?;
            println!("{} bytes", bytes);
        }
        Commands::Rm { host, path } => {
            driver.unlink(&driver.host_key(&host), &path).await.with_context(|| path.clone())?;
        }
        Commands::Mkdir { host, path, mode } => {
            driver.mkdir(&driver.host_key(&host), &path, mode).await.with_context(|| path.clone())?;
        }
        Commands::Rmdir { host, path } => {
            driver.rmdir(&driver.host_key(&host), &path).await.with_context(|| path.clone())?;
        }
        Commands::Mv { host, from, to } => {
            driver
                .rename(&driver.host_key(&host), &from, &to)
                .await
                .with_context(|| format!("{} -> {}", from, to))?;
        }
        Commands::Truncate { host, path, size } => {
            driver
                .truncate(&driver.host_key(&host), &path, size)
                .await
                .with_context(|| path.clone())?;
        }
        Commands::Sum { host, path } => {
            let digest = driver.checksum(&driver.host_key(&host), &path).await.with_context(|| path.clone())?;
            println!("{}  {}", digest, path);
        }
        Commands::Df { host, path } => {
            let fs = driver.statfs(&driver.host_key(&host), &path).await.with_context(|| path.clone())?;
            println!("block size: {}", fs.bsize);
            println!("blocks:     {} ({} free)", fs.blocks, fs.bfree);
            println!("files:      {} ({} free)", fs.files, fs.ffree);
            println!("name max:   {}", keel_core::MAX_FILENAME_LEN);
        }
    }
    Ok(())
}

async fn cat(driver: &RemoteDriver, host: &HostKey, path: &str) -> Result<()> {
    let mut file = driver.open(host, path, OpenFlags::READ_ONLY, 0).await?;
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;

    let copied = loop {
        let count = match driver.pread(&mut file, &mut buf, offset).await {
            Ok(0) => break Ok(()),
            Ok(count) => count,
            Err(kind) => break Err(anyhow::Error::from(kind)),
        };
        if let Err(e) = stdout.write_all(&buf[..count]).await {
            break Err(e.into());
        }
        offset += count as u64;
    };

    driver.close(file).await?;
    stdout.flush().await?;
    copied
}

fn format_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}
