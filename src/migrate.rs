use anyhow::Result;
use sqlx::SqlitePool;

/// Create every table and index the engine needs. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS taxpayers (
            tax_id TEXT PRIMARY KEY,
            uf_code TEXT NOT NULL,
            name TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per taxpayer; `writes` counts every AdvanceCursor call
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            taxpayer_id TEXT PRIMARY KEY,
            last_nsu TEXT NOT NULL,
            writes INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quota_blocks (
            taxpayer_id TEXT PRIMARY KEY,
            rejected_at_ms INTEGER NOT NULL,
            position_at_rejection TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_key TEXT PRIMARY KEY,
            access_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            taxpayer_id TEXT NOT NULL,
            nsu TEXT NOT NULL,
            schema TEXT,
            raw_xml TEXT NOT NULL,
            number TEXT NOT NULL,
            series TEXT NOT NULL,
            model TEXT NOT NULL,
            issued_at TEXT NOT NULL,
            counterparty_id TEXT NOT NULL,
            counterparty_name TEXT,
            total_value TEXT,
            event_type TEXT,
            status TEXT NOT NULL DEFAULT 'authorized',
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backfill_jobs (
            job_id TEXT PRIMARY KEY,
            taxpayer_id TEXT NOT NULL,
            keys_json TEXT NOT NULL,
            items_total INTEGER NOT NULL,
            items_done INTEGER NOT NULL,
            last_item TEXT,
            status TEXT NOT NULL,
            resume_after_ms INTEGER,
            started_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS key_lookups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            taxpayer_id TEXT NOT NULL,
            called_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_taxpayer ON documents(taxpayer_id, kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_access_key ON documents(access_key)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_key_lookups_taxpayer ON key_lookups(taxpayer_id, called_at_ms)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_backfill_jobs_taxpayer ON backfill_jobs(taxpayer_id)")
        .execute(pool)
        .await?;

    Ok(())
}
