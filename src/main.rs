//! # govdata-harness CLI (`gdh`)
//!
//! The `gdh` binary drives the ingestion and derivation pipeline: one-off
//! syncs, derivation cycles, single cadence Runs, the recurring scheduler,
//! and the HTTP trigger.
//!
//! ## Usage
//!
//! ```bash
//! gdh --config ./config/gdh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gdh init` | Create the SQLite database and run schema migrations |
//! | `gdh sources` | List configured sources and credential status |
//! | `gdh stats` | Record counts, latest health snapshot |
//! | `gdh sync` | One ingestion pass with maintenance steps |
//! | `gdh derive [--deep]` | One full derivation cycle |
//! | `gdh run <cadence>` | One Run of `hourly`, `daily`, `weekly`, or `manual` |
//! | `gdh schedule` | Run the cadences until ctrl-c |
//! | `gdh serve` | Start the HTTP trigger (`POST /ingest`) |
//! | `gdh runs` | Show recent Runs |
//!
//! Logging goes to stderr and is filtered with `RUST_LOG`
//! (default `govdata_harness=info`); `--log-json` switches to JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use govdata_harness::config;
use govdata_harness::connector::ConnectorRegistry;
use govdata_harness::derive;
use govdata_harness::ingest;
use govdata_harness::migrate;
use govdata_harness::models::{RunOptions, TriggerKind};
use govdata_harness::scheduler::{self, Scheduler, TriggerOutcome};
use govdata_harness::server;
use govdata_harness::sources;
use govdata_harness::stats;
use govdata_harness::store::sqlite::SqliteStore;
use govdata_harness::store::Store;

/// govdata-harness: multi-source ingestion and derivation for public
/// procurement, grant, and regulatory data.
#[derive(Parser)]
#[command(
    name = "gdh",
    about = "govdata-harness — ingestion and derivation pipeline for public procurement data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gdh.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources and whether their credentials are present.
    Sources,

    /// Show record counts and the latest health snapshot.
    Stats,

    /// Run one ingestion pass followed by the maintenance steps.
    Sync {
        #[command(flatten)]
        families: FamilyFlags,

        /// Only these source ids (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Override the partition list of every selected source (repeatable).
        #[arg(long = "partition")]
        partitions: Vec<String>,
    },

    /// Run one full derivation cycle over the current corpus.
    Derive {
        /// Include the pairwise network pass and aggregate refresh.
        #[arg(long)]
        deep: bool,
    },

    /// Run one cadence now: hourly, daily, weekly, or manual.
    Run {
        cadence: String,

        #[command(flatten)]
        families: FamilyFlags,
    },

    /// Run the recurring scheduler until ctrl-c.
    Schedule,

    /// Start the HTTP server.
    Serve {
        /// Also run the recurring scheduler in this process.
        #[arg(long)]
        with_scheduler: bool,
    },

    /// Show recent Runs, newest first.
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Family toggles, mirroring the `POST /ingest` body.
#[derive(clap::Args)]
struct FamilyFlags {
    #[arg(long)]
    no_contracts: bool,
    #[arg(long)]
    no_grants: bool,
    #[arg(long)]
    no_opportunities: bool,
    #[arg(long)]
    no_states: bool,
    /// Include historical sources (off by default).
    #[arg(long)]
    historical: bool,
}

impl FamilyFlags {
    fn options(&self) -> RunOptions {
        RunOptions {
            contracts: !self.no_contracts,
            grants: !self.no_grants,
            opportunities: !self.no_opportunities,
            states: !self.no_states,
            historical: self.historical,
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "govdata_harness=info";

/// `RUST_LOG` wins outright; the default applies only when it is unset,
/// blank, or unparsable.
fn log_filter(rust_log: Option<String>) -> EnvFilter {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = log_filter(std::env::var("RUST_LOG").ok());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Sync {
            families,
            sources,
            partitions,
        } => {
            let partitions = (!partitions.is_empty()).then_some(partitions);
            ingest::run_sync(&cfg, &families.options(), &sources, partitions).await?;
        }
        Commands::Derive { deep } => {
            derive::run_derive(&cfg, deep).await?;
        }
        Commands::Run { cadence, families } => {
            let Some(kind) = TriggerKind::parse(&cadence) else {
                bail!(
                    "Unknown cadence: '{}'. Available: hourly, daily, weekly, manual",
                    cadence
                );
            };
            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg).await?);
            let registry = Arc::new(ConnectorRegistry::from_config(&cfg)?);
            let scheduler = Scheduler::new(registry, store, &cfg);
            match scheduler.trigger(kind, families.options()).await? {
                TriggerOutcome::Completed(run) => {
                    println!("{}", serde_json::to_string_pretty(&run)?);
                }
                TriggerOutcome::Skipped(kind) => {
                    println!("{} run already in progress, skipped", kind);
                }
            }
        }
        Commands::Schedule => {
            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg).await?);
            scheduler::run_schedule(&cfg, store).await?;
        }
        Commands::Serve { with_scheduler } => {
            server::run_server(&cfg, with_scheduler).await?;
        }
        Commands::Runs { limit } => {
            stats::run_runs(&cfg, limit).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_is_not_overridden_by_default() {
        let filter = log_filter(Some("govdata_harness=debug".to_string()));
        assert_eq!(filter.to_string(), "govdata_harness=debug");
    }

    #[test]
    fn default_filter_when_rust_log_unset_or_blank() {
        assert_eq!(log_filter(None).to_string(), DEFAULT_LOG_FILTER);
        assert_eq!(log_filter(Some("  ".into())).to_string(), DEFAULT_LOG_FILTER);
    }
}
