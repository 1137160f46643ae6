//! SQLite-backed [`SyncStore`] implementation.
//!
//! Maps each store operation onto the schema created by
//! [`crate::migrate::apply`]. Multi-row operations (cursor advance with
//! quota clearing, full reset, kind-aware upsert) run inside a single
//! `BEGIN IMMEDIATE` transaction (see [`crate::db::begin_write`]).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    AccessKey, DocumentKind, DocumentRecord, DocumentStatus, JobState, JobStatus, Nsu, QuotaBlock,
    Taxpayer, UpsertOutcome,
};

use super::{is_cancellation, plan_upsert, DocumentCounts, SyncStore, CANCELLATION_EVENT};

/// SQLite implementation of the [`SyncStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn from_secs(s: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(s, 0).single().unwrap_or_default()
}

fn parse_nsu(s: &str) -> SyncResult<Nsu> {
    s.parse::<Nsu>()
        .map_err(|e| SyncError::Store(format!("corrupt NSU in store: {}", e)))
}

fn row_to_document(row: &SqliteRow) -> SyncResult<DocumentRecord> {
    let kind_str: String = row.get("kind");
    let kind = DocumentKind::parse(&kind_str)
        .ok_or_else(|| SyncError::Store(format!("unknown document kind '{}'", kind_str)))?;
    let access_key: String = row.get("access_key");
    let nsu: String = row.get("nsu");
    let status: String = row.get("status");

    Ok(DocumentRecord {
        doc_key: row.get("doc_key"),
        access_key: AccessKey::parse(&access_key)
            .map_err(|e| SyncError::Store(e.to_string()))?,
        kind,
        taxpayer_id: row.get("taxpayer_id"),
        nsu: parse_nsu(&nsu)?,
        schema: row.get("schema"),
        raw_xml: row.get("raw_xml"),
        number: row.get("number"),
        series: row.get("series"),
        model: row.get("model"),
        issued_at: row.get("issued_at"),
        counterparty_id: row.get("counterparty_id"),
        counterparty_name: row.get("counterparty_name"),
        total_value: row.get("total_value"),
        event_type: row.get("event_type"),
        status: DocumentStatus::parse(&status),
        content_hash: row.get("content_hash"),
    })
}

fn row_to_job(row: &SqliteRow) -> SyncResult<JobState> {
    let keys_json: String = row.get("keys_json");
    let keys: Vec<String> = serde_json::from_str(&keys_json)
        .map_err(|e| SyncError::Store(format!("corrupt job key set: {}", e)))?;
    let items_total: i64 = row.get("items_total");
    let items_done: i64 = row.get("items_done");
    let status: String = row.get("status");
    let resume_after: Option<i64> = row.get("resume_after_ms");

    Ok(JobState {
        job_id: row.get("job_id"),
        taxpayer_id: row.get("taxpayer_id"),
        keys,
        items_total: items_total as u64,
        items_done: items_done as u64,
        last_item_processed: row.get("last_item"),
        started_at: from_secs(row.get("started_at")),
        updated_at: from_secs(row.get("updated_at")),
        status: JobStatus::parse(&status),
        resume_after: resume_after.map(from_millis),
    })
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn register_taxpayer(&self, taxpayer: &Taxpayer) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO taxpayers (tax_id, uf_code, name, created_at) VALUES (?, ?, ?, ?) ON CONFLICT(tax_id) DO NOTHING",
        )
        .bind(&taxpayer.tax_id)
        .bind(&taxpayer.uf_code)
        .bind(&taxpayer.name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_taxpayers(&self) -> SyncResult<Vec<Taxpayer>> {
        let rows = sqlx::query("SELECT tax_id, uf_code, name FROM taxpayers ORDER BY tax_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| Taxpayer {
                tax_id: r.get("tax_id"),
                uf_code: r.get("uf_code"),
                name: r.get("name"),
            })
            .collect())
    }

    async fn remove_taxpayer(&self, tax_id: &str) -> SyncResult<bool> {
        let mut tx = db::begin_write(&self.pool).await?;
        let removed = sqlx::query("DELETE FROM taxpayers WHERE tax_id = ?")
            .bind(tax_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        for table in ["cursors", "quota_blocks", "backfill_jobs", "key_lookups"] {
            sqlx::query(&format!("DELETE FROM {} WHERE taxpayer_id = ?", table))
                .bind(tax_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn get_cursor(&self, taxpayer_id: &str) -> SyncResult<Nsu> {
        let nsu: Option<String> =
            sqlx::query_scalar("SELECT last_nsu FROM cursors WHERE taxpayer_id = ?")
                .bind(taxpayer_id)
                .fetch_optional(&self.pool)
                .await?;
        match nsu {
            Some(s) => parse_nsu(&s),
            None => Ok(Nsu::ZERO),
        }
    }

    async fn advance_cursor(
        &self,
        taxpayer_id: &str,
        nsu: Nsu,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut tx = db::begin_write(&self.pool).await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT last_nsu FROM cursors WHERE taxpayer_id = ?")
                .bind(taxpayer_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = match current {
            Some(s) => parse_nsu(&s)?,
            None => Nsu::ZERO,
        };
        if nsu < current {
            return Err(SyncError::Protocol(format!(
                "cursor for {} would move backwards ({} -> {})",
                taxpayer_id, current, nsu
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO cursors (taxpayer_id, last_nsu, writes, updated_at) VALUES (?, ?, 1, ?)
            ON CONFLICT(taxpayer_id) DO UPDATE SET
                last_nsu = excluded.last_nsu,
                writes = cursors.writes + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(taxpayer_id)
        .bind(nsu.to_string())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?;

        // Zero-padded NSUs compare correctly as text
        sqlx::query(
            "DELETE FROM quota_blocks WHERE taxpayer_id = ? AND position_at_rejection < ?",
        )
        .bind(taxpayer_id)
        .bind(nsu.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cursor_writes(&self, taxpayer_id: &str) -> SyncResult<u64> {
        let writes: Option<i64> =
            sqlx::query_scalar("SELECT writes FROM cursors WHERE taxpayer_id = ?")
                .bind(taxpayer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(writes.unwrap_or(0) as u64)
    }

    async fn get_quota_block(&self, taxpayer_id: &str) -> SyncResult<Option<QuotaBlock>> {
        let row = sqlx::query(
            "SELECT rejected_at_ms, position_at_rejection FROM quota_blocks WHERE taxpayer_id = ?",
        )
        .bind(taxpayer_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let pos: String = r.get("position_at_rejection");
                Ok(Some(QuotaBlock {
                    taxpayer_id: taxpayer_id.to_string(),
                    rejected_at: from_millis(r.get("rejected_at_ms")),
                    position_at_rejection: parse_nsu(&pos)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_quota_block(&self, block: &QuotaBlock) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_blocks (taxpayer_id, rejected_at_ms, position_at_rejection) VALUES (?, ?, ?)
            ON CONFLICT(taxpayer_id) DO UPDATE SET
                rejected_at_ms = excluded.rejected_at_ms,
                position_at_rejection = excluded.position_at_rejection
            "#,
        )
        .bind(&block.taxpayer_id)
        .bind(block.rejected_at.timestamp_millis())
        .bind(block.position_at_rejection.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_quota_block(&self, taxpayer_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM quota_blocks WHERE taxpayer_id = ?")
            .bind(taxpayer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_all(&self, taxpayer_id: &str, now: DateTime<Utc>) -> SyncResult<()> {
        let mut tx = db::begin_write(&self.pool).await?;

        sqlx::query(
            r#"
            INSERT INTO cursors (taxpayer_id, last_nsu, writes, updated_at) VALUES (?, ?, 1, ?)
            ON CONFLICT(taxpayer_id) DO UPDATE SET
                last_nsu = excluded.last_nsu,
                writes = cursors.writes + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(taxpayer_id)
        .bind(Nsu::ZERO.to_string())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM quota_blocks WHERE taxpayer_id = ?")
            .bind(taxpayer_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM backfill_jobs WHERE taxpayer_id = ?")
            .bind(taxpayer_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_document(
        &self,
        doc: &DocumentRecord,
        now: DateTime<Utc>,
    ) -> SyncResult<UpsertOutcome> {
        let mut tx = db::begin_write(&self.pool).await?;

        let existing = sqlx::query("SELECT kind, status FROM documents WHERE doc_key = ?")
            .bind(&doc.doc_key)
            .fetch_optional(&mut *tx)
            .await?;
        let existing = match existing {
            Some(r) => {
                let kind: String = r.get("kind");
                let status: String = r.get("status");
                let kind = DocumentKind::parse(&kind)
                    .ok_or_else(|| SyncError::Store(format!("unknown document kind '{}'", kind)))?;
                Some((kind, DocumentStatus::parse(&status)))
            }
            None => None,
        };

        let cancelled_by_event = if doc.kind == DocumentKind::Event {
            false
        } else {
            sqlx::query_scalar::<_, bool>(
                "SELECT COUNT(*) > 0 FROM documents WHERE access_key = ? AND kind = 'EVENT' AND event_type = ?",
            )
            .bind(doc.access_key.as_str())
            .bind(CANCELLATION_EVENT)
            .fetch_one(&mut *tx)
            .await?
        };

        let outcome = match plan_upsert(existing, doc, cancelled_by_event) {
            Some((outcome, kind, status)) => {
                sqlx::query(
                    r#"
                    INSERT INTO documents (doc_key, access_key, kind, taxpayer_id, nsu, schema, raw_xml,
                                           number, series, model, issued_at, counterparty_id,
                                           counterparty_name, total_value, event_type, status,
                                           content_hash, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(doc_key) DO UPDATE SET
                        kind = excluded.kind,
                        nsu = excluded.nsu,
                        schema = excluded.schema,
                        raw_xml = excluded.raw_xml,
                        number = excluded.number,
                        series = excluded.series,
                        model = excluded.model,
                        issued_at = excluded.issued_at,
                        counterparty_id = excluded.counterparty_id,
                        counterparty_name = excluded.counterparty_name,
                        total_value = excluded.total_value,
                        event_type = excluded.event_type,
                        status = excluded.status,
                        content_hash = excluded.content_hash,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&doc.doc_key)
                .bind(doc.access_key.as_str())
                .bind(kind.as_str())
                .bind(&doc.taxpayer_id)
                .bind(doc.nsu.to_string())
                .bind(&doc.schema)
                .bind(&doc.raw_xml)
                .bind(&doc.number)
                .bind(&doc.series)
                .bind(&doc.model)
                .bind(&doc.issued_at)
                .bind(&doc.counterparty_id)
                .bind(&doc.counterparty_name)
                .bind(&doc.total_value)
                .bind(&doc.event_type)
                .bind(status.as_str())
                .bind(&doc.content_hash)
                .bind(now.timestamp())
                .bind(now.timestamp())
                .execute(&mut *tx)
                .await?;
                outcome
            }
            None => UpsertOutcome::Unchanged,
        };

        if is_cancellation(doc) {
            sqlx::query(
                "UPDATE documents SET status = 'cancelled', updated_at = ? WHERE access_key = ? AND kind != 'EVENT'",
            )
            .bind(now.timestamp())
            .bind(doc.access_key.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_document(&self, doc_key: &str) -> SyncResult<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE doc_key = ?")
            .bind(doc_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(
        &self,
        taxpayer_id: &str,
        kind: Option<DocumentKind>,
    ) -> SyncResult<Vec<DocumentRecord>> {
        let rows = match kind {
            Some(k) => {
                sqlx::query(
                    "SELECT * FROM documents WHERE taxpayer_id = ? AND kind = ? ORDER BY nsu, doc_key",
                )
                .bind(taxpayer_id)
                .bind(k.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM documents WHERE taxpayer_id = ? AND kind != 'EVENT' ORDER BY nsu, doc_key",
                )
                .bind(taxpayer_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_document).collect()
    }

    async fn document_counts(&self, taxpayer_id: &str) -> SyncResult<DocumentCounts> {
        let rows = sqlx::query(
            "SELECT kind, COUNT(*) AS n FROM documents WHERE taxpayer_id = ? GROUP BY kind",
        )
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = DocumentCounts::default();
        for row in &rows {
            let kind: String = row.get("kind");
            let n: i64 = row.get("n");
            match DocumentKind::parse(&kind) {
                Some(DocumentKind::Full) => counts.full = n as u64,
                Some(DocumentKind::Summary) => counts.summary = n as u64,
                Some(DocumentKind::Event) => counts.events = n as u64,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn save_job(&self, job: &JobState) -> SyncResult<()> {
        let keys_json = serde_json::to_string(&job.keys)
            .map_err(|e| SyncError::Store(format!("cannot encode job key set: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO backfill_jobs (job_id, taxpayer_id, keys_json, items_total, items_done,
                                       last_item, status, resume_after_ms, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                items_done = excluded.items_done,
                last_item = excluded.last_item,
                status = excluded.status,
                resume_after_ms = excluded.resume_after_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.taxpayer_id)
        .bind(&keys_json)
        .bind(job.items_total as i64)
        .bind(job.items_done as i64)
        .bind(&job.last_item_processed)
        .bind(job.status.as_str())
        .bind(job.resume_after.map(|t| t.timestamp_millis()))
        .bind(job.started_at.timestamp())
        .bind(job.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> SyncResult<Option<JobState>> {
        let row = sqlx::query("SELECT * FROM backfill_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self, taxpayer_id: Option<&str>) -> SyncResult<Vec<JobState>> {
        let rows = match taxpayer_id {
            Some(t) => {
                sqlx::query("SELECT * FROM backfill_jobs WHERE taxpayer_id = ? ORDER BY started_at")
                    .bind(t)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM backfill_jobs ORDER BY started_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    async fn delete_job(&self, job_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM backfill_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_key_lookup(&self, taxpayer_id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query("INSERT INTO key_lookups (taxpayer_id, called_at_ms) VALUES (?, ?)")
            .bind(taxpayer_id)
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn key_lookups_since(
        &self,
        taxpayer_id: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<DateTime<Utc>>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT called_at_ms FROM key_lookups WHERE taxpayer_id = ? AND called_at_ms >= ? ORDER BY called_at_ms",
        )
        .bind(taxpayer_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(from_millis).collect())
    }

    async fn prune_key_lookups(&self, before: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query("DELETE FROM key_lookups WHERE called_at_ms < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::record;
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    const TP: &str = "99999999000191";

    async fn open(tmp: &TempDir) -> SqliteStore {
        let cfg = Config::with_db_path(tmp.path().join("dfe.sqlite"));
        let pool = crate::db::connect(&cfg).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn cursor_round_trip_and_block_clearing() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let now = Utc::now();

        assert_eq!(store.get_cursor(TP).await.unwrap(), Nsu::ZERO);
        store
            .put_quota_block(&QuotaBlock {
                taxpayer_id: TP.into(),
                rejected_at: now,
                position_at_rejection: Nsu::new(10),
            })
            .await
            .unwrap();

        store.advance_cursor(TP, Nsu::new(10), now).await.unwrap();
        store.advance_cursor(TP, Nsu::new(10), now).await.unwrap();
        assert_eq!(store.cursor_writes(TP).await.unwrap(), 2);
        assert!(store.get_quota_block(TP).await.unwrap().is_some());

        store.advance_cursor(TP, Nsu::new(11), now).await.unwrap();
        assert!(store.get_quota_block(TP).await.unwrap().is_none());
        assert!(store.advance_cursor(TP, Nsu::new(3), now).await.is_err());
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_key() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let now = Utc::now();

        store
            .upsert_document(&record(DocumentKind::Summary, 1), now)
            .await
            .unwrap();
        let outcome = store
            .upsert_document(&record(DocumentKind::Full, 2), now)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Promoted);
        store
            .upsert_document(&record(DocumentKind::Summary, 3), now)
            .await
            .unwrap();

        let docs = store.list_documents(TP, None).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].kind, DocumentKind::Full);
        assert_eq!(docs[0].nsu, Nsu::new(2));
    }

    #[tokio::test]
    async fn events_are_hidden_and_cancel() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let now = Utc::now();

        store
            .upsert_document(&record(DocumentKind::Event, 1), now)
            .await
            .unwrap();
        store
            .upsert_document(&record(DocumentKind::Summary, 2), now)
            .await
            .unwrap();

        let visible = store.list_documents(TP, None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].status, DocumentStatus::Cancelled);

        let events = store
            .list_documents(TP, Some(DocumentKind::Event))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DocumentKind::Event);
    }

    #[tokio::test]
    async fn job_checkpoint_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut job = JobState {
            job_id: "job-1".into(),
            taxpayer_id: TP.into(),
            keys: vec!["a".into(), "b".into()],
            items_total: 2,
            items_done: 0,
            last_item_processed: None,
            started_at: now,
            updated_at: now,
            status: JobStatus::Running,
            resume_after: None,
        };
        store.save_job(&job).await.unwrap();
        job.items_done = 1;
        job.last_item_processed = Some("a".into());
        job.status = JobStatus::Suspended;
        job.resume_after = Some(now + chrono::Duration::minutes(65));
        store.save_job(&job).await.unwrap();

        assert_eq!(store.load_job("job-1").await.unwrap(), Some(job));
        store.reset_all(TP, now).await.unwrap();
        assert!(store.load_job("job-1").await.unwrap().is_none());
    }
}
