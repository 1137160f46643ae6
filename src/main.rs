//! # dfe-harvest CLI (`dfe`)
//!
//! The `dfe` binary drives the distribution sync engine: database setup,
//! taxpayer registration, cursor sync cycles, targeted backfill jobs and
//! status reporting.
//!
//! ## Usage
//!
//! ```bash
//! dfe --config ./config/dfe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dfe init` | Create the SQLite database and register configured taxpayers |
//! | `dfe taxpayer add\|list\|remove` | Manage the taxpayer registry |
//! | `dfe sync <id\|all>` | Run one cursor cycle per taxpayer |
//! | `dfe backfill <id>` | Fetch full documents for stored summaries |
//! | `dfe status [<id>]` | Cursor, cool-down and document counts |
//! | `dfe docs <id>` | List stored documents |
//! | `dfe jobs` | List resumable backfill jobs |
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` (default
//! `info`) to change verbosity.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dfe_harvest::progress::ProgressMode;
use dfe_harvest::{config, status, sync_cmd};

/// dfe-harvest CLI: cursor-based retrieval of fiscal documents from the
/// DF-e distribution service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dfe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dfe",
    about = "dfe-harvest: sync fiscal documents from the DF-e distribution service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dfe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables, then registers
    /// every `[[taxpayers]]` entry from the config. Idempotent.
    Init,

    /// Manage the taxpayer registry.
    Taxpayer {
        #[command(subcommand)]
        action: TaxpayerAction,
    },

    /// Run one sync cycle per taxpayer.
    ///
    /// Walks the NSU feed from the stored cursor until the feed is drained,
    /// the authority rate-limits the taxpayer, or the batch cap is reached.
    Sync {
        /// Taxpayer tax id, or `all`.
        target: String,

        /// Reset the cursor to zero and re-read the whole feed.
        #[arg(long)]
        full: bool,

        /// Progress output: off, human or json. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Fetch full documents one access key at a time.
    ///
    /// Without `--keys` the job covers every stored summary of the taxpayer.
    Backfill {
        /// Taxpayer tax id.
        tax_id: String,

        /// Explicit access keys instead of the stored summaries.
        #[arg(long, num_args = 1..)]
        keys: Vec<String>,

        /// Continue a suspended job.
        #[arg(long, conflicts_with = "keys")]
        resume: Option<String>,

        /// Progress output: off, human or json. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show cursor position, cool-down state and document counts.
    Status {
        /// Limit the report to one taxpayer.
        tax_id: Option<String>,
    },

    /// List stored documents of a taxpayer.
    Docs {
        tax_id: String,

        /// Filter by kind: full, summary or event. Events are hidden by default.
        #[arg(long)]
        kind: Option<String>,
    },

    /// List resumable backfill jobs.
    Jobs,
}

#[derive(Subcommand)]
enum TaxpayerAction {
    /// Register a taxpayer.
    Add {
        /// 14-digit CNPJ or 11-digit CPF.
        tax_id: String,

        /// Two-digit IBGE state code of the requesting authority.
        #[arg(long)]
        uf: String,

        #[arg(long)]
        name: Option<String>,
    },
    /// List registered and configured taxpayers.
    List,
    /// Remove a taxpayer with its cursor, quota state and jobs.
    Remove { tax_id: String },
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => ProgressMode::parse(s)
            .ok_or_else(|| anyhow::anyhow!("Invalid --progress '{}': expected off, human or json", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            sync_cmd::run_init(&cfg).await?;
        }
        Commands::Taxpayer { action } => match action {
            TaxpayerAction::Add { tax_id, uf, name } => {
                sync_cmd::run_taxpayer_add(&cfg, &tax_id, &uf, name).await?;
            }
            TaxpayerAction::List => {
                sync_cmd::run_taxpayer_list(&cfg).await?;
            }
            TaxpayerAction::Remove { tax_id } => {
                sync_cmd::run_taxpayer_remove(&cfg, &tax_id).await?;
            }
        },
        Commands::Sync {
            target,
            full,
            progress,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            sync_cmd::run_sync(&cfg, &target, full, mode).await?;
        }
        Commands::Backfill {
            tax_id,
            keys,
            resume,
            progress,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            sync_cmd::run_backfill(&cfg, &tax_id, keys, resume, mode).await?;
        }
        Commands::Status { tax_id } => {
            status::run_status(&cfg, tax_id.as_deref()).await?;
        }
        Commands::Docs { tax_id, kind } => {
            status::run_docs(&cfg, &tax_id, kind.as_deref()).await?;
        }
        Commands::Jobs => {
            sync_cmd::run_jobs(&cfg).await?;
        }
    }

    Ok(())
}
