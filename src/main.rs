//! # Chunkflow CLI (`chunkflow`)
//!
//! ## Usage
//!
//! ```bash
//! chunkflow --config ./config/chunkflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chunkflow init` | Create the data directory of every configured tenant |
//! | `chunkflow produce` | Run one discovery process per tenant |
//! | `chunkflow consume` | Run the consumer worker pool |
//! | `chunkflow run` | Run discovery and consumers together |
//! | `chunkflow status` | Show published / completed counts and group backlog |
//!
//! `chunkflow worker ...` is hidden; the supervisor uses it to start each
//! child process.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkflow::config::{self, Config};
use chunkflow::consumer::ConsumerWorker;
use chunkflow::discovery::{self, DiscoveryWorker};
use chunkflow::status;
use chunkflow::supervisor::{self, Workload};

/// Multi-tenant document ingestion over Redis Streams.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chunkflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chunkflow",
    about = "Chunkflow — multi-tenant document ingestion over Redis Streams",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/chunkflow.toml`. A missing file means built-in
    /// defaults.
    #[arg(long, global = true, default_value = "./config/chunkflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create `data_dir/<tenant>` for every configured tenant.
    ///
    /// Idempotent.
    Init,

    /// Start one discovery process per tenant and wait for Ctrl+C.
    Produce,

    /// Start the consumer worker pool and wait for Ctrl+C.
    Consume,

    /// Start discovery and consumers together.
    Run,

    /// Print per-tenant published and completed file counts and the
    /// consumer group's pending count.
    Status,

    #[command(subcommand, hide = true)]
    Worker(WorkerRole),
}

/// Single-worker entry points used by the supervisor.
#[derive(Subcommand)]
enum WorkerRole {
    /// Run the discovery loop for one tenant.
    Discover {
        #[arg(long)]
        tenant: String,
    },
    /// Run one consumer of the pool.
    Consume {
        #[arg(long)]
        ordinal: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunkflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let dirs = discovery::ensure_tenant_dirs(&cfg)?;
            println!("Created {} tenant directories.", dirs.len());
        }
        Commands::Produce => supervise(&cfg, &cli.config, Workload::Discovery).await?,
        Commands::Consume => supervise(&cfg, &cli.config, Workload::Consumers).await?,
        Commands::Run => supervise(&cfg, &cli.config, Workload::All).await?,
        Commands::Status => status::run_status(&cfg).await?,
        Commands::Worker(WorkerRole::Discover { tenant }) => {
            let span = info_span!("discovery", tenant = %tenant);
            async {
                let worker = DiscoveryWorker::connect(&cfg, &tenant).await?;
                worker.run().await;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(span)
            .await?;
        }
        Commands::Worker(WorkerRole::Consume { ordinal }) => {
            let name = cfg.consumer.consumer_name(std::process::id(), ordinal);
            let span = info_span!("consumer", name = %name);
            async {
                let mut worker = ConsumerWorker::connect(&cfg, &name).await?;
                worker.run().await;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(span)
            .await?;
        }
    }

    Ok(())
}

async fn supervise(cfg: &Config, config_path: &std::path::Path, workload: Workload) -> Result<()> {
    info!(workload = ?workload, "Starting workers");
    let config_path = supervisor::resolve_config_path(config_path);
    supervisor::run_supervisor(cfg, &config_path, workload).await
}
