use anyhow::{Context, Result};
use cfsync::config::Config;
use cfsync::locks::{LockManager, LockSettings, PurgeReport};
use cfsync::store::FjallStore;
use cfsync::stream::{self, FrameChannel};
use cfsync::transport::{ServeSession, SshTarget};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cfsync")]
#[command(version, about = "Promise locks and delta file streaming", long_about = None)]
struct Cli {
    /// Configuration file (default: $CFSYNC_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); overrides RUST_LOG
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evict lock records older than the usage-dependent horizon
    PurgeLocks,

    /// Serve a file over stdin/stdout (the server side of a fetch)
    Serve {
        /// Up-to-date source file
        source: PathBuf,
    },

    /// Fetch a file from a `cfsync serve` process, patching a local basis
    Fetch {
        /// Run the server side over ssh ([user@]host[:port]); local otherwise
        #[arg(long)]
        ssh: Option<String>,

        /// Permissions of the destination file (octal)
        #[arg(long, default_value = "600", value_parser = parse_mode)]
        mode: u32,

        /// Source path on the serving side
        remote: PathBuf,

        /// Outdated local copy used as the delta basis
        basis: PathBuf,

        /// Where to write the fetched file
        dest: PathBuf,
    },

    /// Print the time recorded under a lock name
    LockTime {
        /// Full lock name, e.g. `last.<bundle>...`
        name: String,
    },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid octal mode '{}': {}", s, e))
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    // stdout carries the wire protocol in `serve`
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_locks(config: &Config) -> Result<LockManager> {
    let path = config.locks.lock_db_path();
    let store = FjallStore::open(&path, config.locks.max_store_bytes)
        .with_context(|| format!("Failed to open lock database {}", path.display()))?;
    Ok(LockManager::new(
        Arc::new(store),
        LockSettings::from(&config.locks),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::PurgeLocks => {
            let manager = open_locks(&config)?;
            match manager.purge_locks() {
                PurgeReport::Disabled => println!("Lock database usage is low, nothing purged"),
                PurgeReport::NotDue { horizon_secs } => {
                    println!("Purge not due yet (horizon {}s)", horizon_secs)
                }
                PurgeReport::Purged {
                    horizon_secs,
                    deleted,
                } => println!(
                    "Purged {} lock records older than {}s",
                    deleted, horizon_secs
                ),
                PurgeReport::Failed => anyhow::bail!("Lock purge failed, see log"),
            }
        }

        Commands::Serve { source } => {
            let mut chan = FrameChannel::new(
                tokio::io::stdin(),
                tokio::io::stdout(),
                config.stream.max_buffer_size,
            );
            stream::serve(&mut chan, &source)
                .await
                .with_context(|| format!("Failed to serve {}", source.display()))?;
        }

        Commands::Fetch {
            ssh,
            mode,
            remote,
            basis,
            dest,
        } => {
            let session = match ssh {
                Some(target) => {
                    let target = SshTarget::parse(&target)?;
                    ServeSession::connect_ssh(&target, &remote).await?
                }
                None => ServeSession::connect_local(&remote).await?,
            };
            let (stdout, stdin, mut child) = session.split();

            let mut chan = FrameChannel::new(stdout, stdin, config.stream.max_buffer_size);
            let result = stream::fetch(&mut chan, &basis, &dest, mode).await;
            drop(chan);
            let status = child.wait().await.context("Failed to wait for server")?;

            result.with_context(|| {
                format!("Failed to fetch {} into {}", remote.display(), dest.display())
            })?;
            if !status.success() {
                anyhow::bail!("Server exited with {}", status);
            }
            tracing::info!("Fetched {} into {}", remote.display(), dest.display());
        }

        Commands::LockTime { name } => {
            let manager = open_locks(&config)?;
            match manager.find_lock_time(&name) {
                Some(time) => {
                    let when = chrono::DateTime::from_timestamp(time, 0)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "invalid time".to_string());
                    println!("{} {} ({})", name, time, when);
                }
                None => println!("{} never", name),
            }
        }
    }

    Ok(())
}
