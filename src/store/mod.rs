//! Storage abstraction for the sync engine.
//!
//! The [`SyncStore`] trait defines every persisted fact the engine relies
//! on: cursors, quota blocks, documents, resumable jobs and the by-key
//! lookup window. The engine is storage-agnostic; two backends ship with
//! the crate:
//!
//! - [`memory::InMemoryStore`] for tests and embedding.
//! - [`sqlite::SqliteStore`] backed by the schema in [`crate::migrate`].
//!
//! All rows are taxpayer-scoped, so concurrent cycles for different
//! taxpayers never contend on the same row. Implementations must be
//! `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::models::{
    DocumentKind, DocumentRecord, DocumentStatus, JobState, Nsu, QuotaBlock, Taxpayer,
    UpsertOutcome,
};

/// Event type that flips the referenced document to `cancelled`.
pub const CANCELLATION_EVENT: &str = "110111";

/// Per-kind document counts for one taxpayer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentCounts {
    pub full: u64,
    pub summary: u64,
    pub events: u64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_cursor`](SyncStore::get_cursor) | Current NSU (zero when never synced) |
/// | [`advance_cursor`](SyncStore::advance_cursor) | Always-write cursor update |
/// | [`reset_all`](SyncStore::reset_all) | Full resync: cursor, quota block and jobs |
/// | [`upsert_document`](SyncStore::upsert_document) | Kind-aware upsert keyed on `doc_key` |
/// | [`save_job`](SyncStore::save_job) | Checkpoint a resumable job |
/// | [`record_key_lookup`](SyncStore::record_key_lookup) | Count a by-key call |
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn register_taxpayer(&self, taxpayer: &Taxpayer) -> SyncResult<()>;

    async fn list_taxpayers(&self) -> SyncResult<Vec<Taxpayer>>;

    /// Remove a taxpayer together with its cursor, quota block, jobs and
    /// lookup window. Documents are kept.
    async fn remove_taxpayer(&self, tax_id: &str) -> SyncResult<bool>;

    async fn get_cursor(&self, taxpayer_id: &str) -> SyncResult<Nsu>;

    /// Write the cursor, even when `nsu` equals the stored value.
    ///
    /// Fails with a protocol error when `nsu` is lower than the stored
    /// value. Deletes the quota block once `nsu` passes its position.
    async fn advance_cursor(&self, taxpayer_id: &str, nsu: Nsu, now: DateTime<Utc>)
        -> SyncResult<()>;

    /// Number of cursor writes performed for this taxpayer.
    async fn cursor_writes(&self, taxpayer_id: &str) -> SyncResult<u64>;

    async fn get_quota_block(&self, taxpayer_id: &str) -> SyncResult<Option<QuotaBlock>>;

    async fn put_quota_block(&self, block: &QuotaBlock) -> SyncResult<()>;

    async fn clear_quota_block(&self, taxpayer_id: &str) -> SyncResult<()>;

    /// Set the cursor to zero, clear the quota block and delete every job
    /// of the taxpayer, as one unit.
    async fn reset_all(&self, taxpayer_id: &str, now: DateTime<Utc>) -> SyncResult<()>;

    /// Insert or update a document following [`plan_upsert`].
    ///
    /// A cancellation event also flips the referenced document's status.
    async fn upsert_document(
        &self,
        doc: &DocumentRecord,
        now: DateTime<Utc>,
    ) -> SyncResult<UpsertOutcome>;

    async fn get_document(&self, doc_key: &str) -> SyncResult<Option<DocumentRecord>>;

    /// Visible documents of a taxpayer ordered by NSU.
    ///
    /// `None` lists FULL and SUMMARY rows; events only appear when asked
    /// for explicitly.
    async fn list_documents(
        &self,
        taxpayer_id: &str,
        kind: Option<DocumentKind>,
    ) -> SyncResult<Vec<DocumentRecord>>;

    async fn document_counts(&self, taxpayer_id: &str) -> SyncResult<DocumentCounts>;

    async fn save_job(&self, job: &JobState) -> SyncResult<()>;

    async fn load_job(&self, job_id: &str) -> SyncResult<Option<JobState>>;

    async fn list_jobs(&self, taxpayer_id: Option<&str>) -> SyncResult<Vec<JobState>>;

    async fn delete_job(&self, job_id: &str) -> SyncResult<()>;

    async fn record_key_lookup(&self, taxpayer_id: &str, at: DateTime<Utc>) -> SyncResult<()>;

    /// By-key call timestamps at or after `since`, oldest first.
    async fn key_lookups_since(
        &self,
        taxpayer_id: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<DateTime<Utc>>>;

    async fn prune_key_lookups(&self, before: DateTime<Utc>) -> SyncResult<()>;
}

/// Decide how an incoming document lands on an existing row.
///
/// `existing` is the stored `(kind, status)` for the same `doc_key`;
/// `cancelled_by_event` tells whether a cancellation event for the access
/// key is already on file. Returns `None` when the row must stay as is.
pub fn plan_upsert(
    existing: Option<(DocumentKind, DocumentStatus)>,
    incoming: &DocumentRecord,
    cancelled_by_event: bool,
) -> Option<(UpsertOutcome, DocumentKind, DocumentStatus)> {
    let kind = DocumentKind::merge(existing.map(|(k, _)| k), incoming.kind)?;

    let sticky_cancel = cancelled_by_event
        || matches!(existing, Some((_, DocumentStatus::Cancelled)));
    let status = if sticky_cancel && kind != DocumentKind::Event {
        DocumentStatus::Cancelled
    } else {
        incoming.status
    };

    let outcome = match existing {
        None => UpsertOutcome::Inserted,
        Some((DocumentKind::Summary, _)) if kind == DocumentKind::Full => UpsertOutcome::Promoted,
        Some(_) => UpsertOutcome::Updated,
    };
    Some((outcome, kind, status))
}

/// Whether `doc` is an event that cancels the document it references.
pub fn is_cancellation(doc: &DocumentRecord) -> bool {
    doc.kind == DocumentKind::Event && doc.event_type.as_deref() == Some(CANCELLATION_EVENT)
}

#[cfg(test)]
pub(crate) mod testutil {
    use sha2::{Digest, Sha256};

    use crate::models::{AccessKey, DocumentKind, DocumentRecord, DocumentStatus, Nsu};

    pub const KEY: &str = "35210112345678000195550010000123451234567890";

    pub fn record(kind: DocumentKind, nsu: u64) -> DocumentRecord {
        let access_key = AccessKey::parse(KEY).unwrap();
        let doc_key = match kind {
            DocumentKind::Event => format!("ID110111{}01", KEY),
            _ => KEY.to_string(),
        };
        let raw_xml = format!("<doc kind=\"{}\" nsu=\"{}\"/>", kind.as_str(), nsu);
        DocumentRecord {
            doc_key,
            access_key,
            kind,
            taxpayer_id: "99999999000191".to_string(),
            nsu: Nsu::new(nsu),
            schema: None,
            content_hash: hex::encode(Sha256::digest(raw_xml.as_bytes())),
            raw_xml,
            number: "12345".to_string(),
            series: "1".to_string(),
            model: "55".to_string(),
            issued_at: "2021-01".to_string(),
            counterparty_id: "12345678000195".to_string(),
            counterparty_name: None,
            total_value: None,
            event_type: match kind {
                DocumentKind::Event => Some("110111".to_string()),
                _ => None,
            },
            status: DocumentStatus::Authorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::record;
    use super::*;

    #[test]
    fn plan_promotes_summary() {
        let full = record(DocumentKind::Full, 2);
        let (outcome, kind, _) = plan_upsert(
            Some((DocumentKind::Summary, DocumentStatus::Authorized)),
            &full,
            false,
        )
        .unwrap();
        assert_eq!(outcome, UpsertOutcome::Promoted);
        assert_eq!(kind, DocumentKind::Full);
    }

    #[test]
    fn plan_keeps_full_over_summary() {
        let summary = record(DocumentKind::Summary, 3);
        assert!(plan_upsert(
            Some((DocumentKind::Full, DocumentStatus::Authorized)),
            &summary,
            false
        )
        .is_none());
    }

    #[test]
    fn cancellation_is_sticky() {
        let full = record(DocumentKind::Full, 2);
        let (_, _, status) = plan_upsert(
            Some((DocumentKind::Summary, DocumentStatus::Cancelled)),
            &full,
            false,
        )
        .unwrap();
        assert_eq!(status, DocumentStatus::Cancelled);

        let (_, _, status) = plan_upsert(None, &full, true).unwrap();
        assert_eq!(status, DocumentStatus::Cancelled);
    }

    #[test]
    fn detects_cancellation_events() {
        assert!(is_cancellation(&record(DocumentKind::Event, 1)));
        assert!(!is_cancellation(&record(DocumentKind::Full, 1)));
    }
}
