//! CLI glue for `dfe init`, `dfe taxpayer`, `dfe sync`, `dfe backfill` and
//! `dfe jobs`.
//!
//! Builds the production wiring (SQLite store, SOAP client with PEM
//! identities, wall clock) and turns engine reports into terminal output.
//! Ctrl-C cancels the running cycle or job between batches.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::backfill::{BackfillReport, JobOutcome};
use crate::clock::SystemClock;
use crate::config::{validate_tax_id, validate_uf, Config};
use crate::db;
use crate::engine::{CancelToken, CycleOutcome, SyncEngine};
use crate::identity::PemFileIdentity;
use crate::migrate;
use crate::models::Taxpayer;
use crate::progress::{ProgressMode, SyncProgressReporter};
use crate::protocol::SoapClient;
use crate::store::sqlite::SqliteStore;
use crate::store::SyncStore;

/// Connect and make sure the schema is current.
pub async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn build_engine(
    config: &Config,
    store: Arc<SqliteStore>,
    progress: Arc<dyn SyncProgressReporter>,
) -> SyncEngine {
    let identities = Arc::new(PemFileIdentity::from_config(config));
    let service = Arc::new(SoapClient::new(&config.service, identities));
    SyncEngine::new(config, store, service, Arc::new(SystemClock)).with_progress(progress)
}

fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, stopping after the current batch...");
            token.cancel();
        }
    });
    cancel
}

/// Registered taxpayers plus the ones declared in config, without duplicates.
async fn known_taxpayers(config: &Config, store: &dyn SyncStore) -> Result<Vec<Taxpayer>> {
    let mut all = store.list_taxpayers().await?;
    for tp in &config.taxpayers {
        if !all.iter().any(|t| t.tax_id == tp.tax_id) {
            all.push(tp.to_taxpayer());
        }
    }
    Ok(all)
}

async fn find_taxpayer(config: &Config, store: &dyn SyncStore, tax_id: &str) -> Result<Taxpayer> {
    known_taxpayers(config, store)
        .await?
        .into_iter()
        .find(|t| t.tax_id == tax_id)
        .with_context(|| format!("Unknown taxpayer '{}'. Register it with `dfe taxpayer add`.", tax_id))
}

pub async fn run_init(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    for tp in &config.taxpayers {
        store.register_taxpayer(&tp.to_taxpayer()).await?;
    }
    println!("Database initialized successfully.");
    if !config.taxpayers.is_empty() {
        println!("Registered {} taxpayer(s) from config.", config.taxpayers.len());
    }
    store.pool().close().await;
    Ok(())
}

pub async fn run_taxpayer_add(
    config: &Config,
    tax_id: &str,
    uf: &str,
    name: Option<String>,
) -> Result<()> {
    validate_tax_id(tax_id)?;
    validate_uf(uf)?;
    let store = open_store(config).await?;
    store
        .register_taxpayer(&Taxpayer {
            tax_id: tax_id.to_string(),
            uf_code: uf.to_string(),
            name,
        })
        .await?;
    if config.taxpayer(tax_id).is_none() {
        eprintln!(
            "Warning: no [[taxpayers]] entry with an identity_pem for {}; sync will fail until one is added.",
            tax_id
        );
    }
    println!("Registered {}.", tax_id);
    Ok(())
}

pub async fn run_taxpayer_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let taxpayers = known_taxpayers(config, store.as_ref()).await?;
    if taxpayers.is_empty() {
        println!("No taxpayers registered.");
        return Ok(());
    }

    println!("{:<16} {:<4} {:<8} NAME", "TAX ID", "UF", "IDENTITY");
    for tp in &taxpayers {
        let identity = if config.taxpayer(&tp.tax_id).is_some() {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<16} {:<4} {:<8} {}",
            tp.tax_id,
            tp.uf_code,
            identity,
            tp.name.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_taxpayer_remove(config: &Config, tax_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    if !store.remove_taxpayer(tax_id).await? {
        bail!("Taxpayer '{}' is not registered", tax_id);
    }
    println!("Removed {} (stored documents are kept).", tax_id);
    Ok(())
}

/// `dfe sync <id|all>`.
pub async fn run_sync(config: &Config, target: &str, full: bool, progress: ProgressMode) -> Result<()> {
    let store = open_store(config).await?;
    let taxpayers = if target == "all" {
        known_taxpayers(config, store.as_ref()).await?
    } else {
        vec![find_taxpayer(config, store.as_ref(), target).await?]
    };
    if taxpayers.is_empty() {
        bail!("No taxpayers to sync. Add [[taxpayers]] to the config or run `dfe taxpayer add`.");
    }

    let engine = Arc::new(build_engine(config, store.clone(), Arc::from(progress.reporter())));
    let cancel = cancel_on_ctrl_c();
    let reports = engine.sync_all(taxpayers, full, &cancel).await;

    let mut failed = 0;
    for report in &reports {
        println!("{}", report);
        if let Some(b) = &report.backfill {
            println!("  {}", describe_backfill(b));
        }
        if report.outcome == CycleOutcome::Failed {
            failed += 1;
        }
    }
    store.pool().close().await;

    if failed > 0 {
        bail!("{} of {} sync cycle(s) failed", failed, reports.len());
    }
    Ok(())
}

/// `dfe backfill <id> [--keys ...] [--resume <job>]`.
pub async fn run_backfill(
    config: &Config,
    tax_id: &str,
    keys: Vec<String>,
    resume: Option<String>,
    progress: ProgressMode,
) -> Result<()> {
    let store = open_store(config).await?;
    let taxpayer = find_taxpayer(config, store.as_ref(), tax_id).await?;
    let engine = build_engine(config, store.clone(), Arc::from(progress.reporter()));
    let cancel = cancel_on_ctrl_c();

    let report = match resume {
        Some(job_id) => engine
            .resume_backfill(&taxpayer, &job_id, &cancel)
            .await?
            .with_context(|| format!("No job '{}' for taxpayer {}", job_id, tax_id))?,
        None => {
            let keys = if keys.is_empty() { None } else { Some(keys) };
            engine.backfill(&taxpayer, keys, &cancel).await?
        }
    };

    println!("{}", describe_backfill(&report));
    store.pool().close().await;
    Ok(())
}

fn describe_backfill(report: &BackfillReport) -> String {
    let state = match report.outcome {
        JobOutcome::Completed => "completed".to_string(),
        JobOutcome::Cancelled => format!("cancelled, resume with --resume {}", report.job_id),
        JobOutcome::Suspended { retry_after } => format!(
            "suspended, try again in {} minutes with --resume {}",
            retry_after.as_secs().div_ceil(60),
            report.job_id
        ),
    };
    format!(
        "backfill {}  {} / {} keys  promoted {}  skipped {}  {}",
        report.job_id, report.items_done, report.items_total, report.promoted, report.skipped, state
    )
}

/// `dfe jobs`: resumable backfill jobs on file.
pub async fn run_jobs(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let jobs = store.list_jobs(None).await?;
    if jobs.is_empty() {
        println!("No backfill jobs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16} {:<10} {:>11}  UPDATED",
        "JOB", "TAXPAYER", "STATUS", "PROGRESS"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<16} {:<10} {:>11}  {}",
            job.job_id,
            job.taxpayer_id,
            job.status.as_str(),
            format!("{}/{}", job.items_done, job.items_total),
            job.updated_at.format("%Y-%m-%d %H:%M")
        );
        if let Some(at) = job.resume_after {
            println!("{:<36}  resumable after {}", "", at.format("%Y-%m-%d %H:%M"));
        }
    }
    Ok(())
}
