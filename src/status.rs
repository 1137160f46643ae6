//! Cursor, quota and document overview.
//!
//! `dfe status` shows, per taxpayer, where the cursor stands, whether the
//! feed is in its cool-down window ("try again in N minutes"), and how many
//! documents of each kind are on file. `dfe docs` lists stored documents.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::clock::SystemClock;
use crate::config::Config;
use crate::ledger::Ledger;
use crate::models::DocumentKind;
use crate::ratelimit::KeyRateLimiter;
use crate::store::SyncStore;
use crate::sync_cmd::open_store;

struct TaxpayerStatus {
    tax_id: String,
    cursor: String,
    blocked: Option<u64>,
    full: u64,
    summary: u64,
    events: u64,
    jobs: usize,
    keys_left: u32,
}

pub async fn run_status(config: &Config, tax_id: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let clock = Arc::new(SystemClock);
    let ledger = Ledger::new(store.clone(), clock.clone(), config.sync.cooldown());
    let limiter = KeyRateLimiter::from_config(store.clone(), clock, &config.backfill);

    let mut ids: Vec<String> = store
        .list_taxpayers()
        .await?
        .into_iter()
        .map(|t| t.tax_id)
        .collect();
    for tp in &config.taxpayers {
        if !ids.contains(&tp.tax_id) {
            ids.push(tp.tax_id.clone());
        }
    }
    if let Some(only) = tax_id {
        ids.retain(|id| id == only);
        if ids.is_empty() {
            anyhow::bail!("Unknown taxpayer '{}'", only);
        }
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("dfe-harvest status");
    println!("==================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Environment: {:?}", config.service.environment);
    println!();

    if ids.is_empty() {
        println!("  No taxpayers registered.");
        println!();
        return Ok(());
    }

    let mut rows = Vec::new();
    for id in &ids {
        let block = ledger.is_blocked(id).await?;
        let counts = store.document_counts(id).await?;
        rows.push(TaxpayerStatus {
            tax_id: id.clone(),
            cursor: ledger.get_cursor(id).await?.to_string(),
            blocked: block.blocked.then(|| block.remaining_minutes()),
            full: counts.full,
            summary: counts.summary,
            events: counts.events,
            jobs: store.list_jobs(Some(id)).await?.len(),
            keys_left: limiter.remaining(id).await?,
        });
    }

    println!(
        "  {:<16} {:<16} {:>6} {:>8} {:>7} {:>5} {:>7}   {}",
        "TAXPAYER", "CURSOR", "FULL", "SUMMARY", "EVENTS", "JOBS", "KEYS/H", "FEED"
    );
    println!("  {}", "-".repeat(92));
    for r in &rows {
        let feed = match r.blocked {
            Some(mins) => format!("blocked, try again in {} minutes", mins),
            None => "ready".to_string(),
        };
        println!(
            "  {:<16} {:<16} {:>6} {:>8} {:>7} {:>5} {:>7}   {}",
            r.tax_id, r.cursor, r.full, r.summary, r.events, r.jobs, r.keys_left, feed
        );
    }
    println!();

    store.pool().close().await;
    Ok(())
}

/// `dfe docs <id> [--kind full|summary|event]`.
pub async fn run_docs(config: &Config, tax_id: &str, kind: Option<&str>) -> Result<()> {
    let kind = kind
        .map(|k| {
            DocumentKind::parse(&k.to_uppercase())
                .with_context(|| format!("Unknown kind '{}': expected full, summary or event", k))
        })
        .transpose()?;

    let store = open_store(config).await?;
    let docs = store.list_documents(tax_id, kind).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    println!(
        "{:<15}  {:<7} {:<9} {:<44}  {:>9} {:>4}  {:<25} {:<14} {:>12}",
        "NSU", "KIND", "STATUS", "KEY", "NUMBER", "SER", "ISSUED", "ISSUER", "VALUE"
    );
    for d in &docs {
        println!(
            "{:<15}  {:<7} {:<9} {:<44}  {:>9} {:>4}  {:<25} {:<14} {:>12}",
            d.nsu,
            d.kind.as_str(),
            d.status.as_str(),
            d.doc_key,
            d.number,
            d.series,
            d.issued_at,
            d.counterparty_id,
            d.total_value.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("{} document(s)", docs.len());
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
