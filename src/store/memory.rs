//! In-memory [`SyncStore`] implementation for testing and embedding.
//!
//! All tables live in one `HashMap`-based struct behind a
//! `std::sync::RwLock`, so multi-row operations such as
//! [`reset_all`](SyncStore::reset_all) are atomic.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SyncError, SyncResult};
use crate::models::{DocumentKind, DocumentRecord, DocumentStatus, JobState, Nsu, QuotaBlock, Taxpayer, UpsertOutcome};

use super::{is_cancellation, plan_upsert, DocumentCounts, SyncStore};

struct StoredCursor {
    nsu: Nsu,
    writes: u64,
}

#[derive(Default)]
struct Inner {
    taxpayers: HashMap<String, Taxpayer>,
    cursors: HashMap<String, StoredCursor>,
    quota: HashMap<String, QuotaBlock>,
    documents: HashMap<String, DocumentRecord>,
    jobs: HashMap<String, JobState>,
    lookups: Vec<(String, DateTime<Utc>)>,
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> SyncResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| SyncError::Store("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> SyncResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| SyncError::Store("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl SyncStore for InMemoryStore {
    async fn register_taxpayer(&self, taxpayer: &Taxpayer) -> SyncResult<()> {
        let mut inner = self.write()?;
        inner
            .taxpayers
            .entry(taxpayer.tax_id.clone())
            .or_insert_with(|| taxpayer.clone());
        Ok(())
    }

    async fn list_taxpayers(&self) -> SyncResult<Vec<Taxpayer>> {
        let inner = self.read()?;
        let mut out: Vec<Taxpayer> = inner.taxpayers.values().cloned().collect();
        out.sort_by(|a, b| a.tax_id.cmp(&b.tax_id));
        Ok(out)
    }

    async fn remove_taxpayer(&self, tax_id: &str) -> SyncResult<bool> {
        let mut inner = self.write()?;
        let existed = inner.taxpayers.remove(tax_id).is_some();
        inner.cursors.remove(tax_id);
        inner.quota.remove(tax_id);
        inner.jobs.retain(|_, j| j.taxpayer_id != tax_id);
        inner.lookups.retain(|(t, _)| t != tax_id);
        Ok(existed)
    }

    async fn get_cursor(&self, taxpayer_id: &str) -> SyncResult<Nsu> {
        let inner = self.read()?;
        Ok(inner
            .cursors
            .get(taxpayer_id)
            .map(|c| c.nsu)
            .unwrap_or(Nsu::ZERO))
    }

    async fn advance_cursor(
        &self,
        taxpayer_id: &str,
        nsu: Nsu,
        _now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut inner = self.write()?;
        let current = inner.cursors.get(taxpayer_id).map(|c| c.nsu).unwrap_or(Nsu::ZERO);
        if nsu < current {
            return Err(SyncError::Protocol(format!(
                "cursor for {} would move backwards ({} -> {})",
                taxpayer_id, current, nsu
            )));
        }
        let entry = inner
            .cursors
            .entry(taxpayer_id.to_string())
            .or_insert(StoredCursor {
                nsu: Nsu::ZERO,
                writes: 0,
            });
        entry.nsu = nsu;
        entry.writes += 1;

        let passed_block = inner
            .quota
            .get(taxpayer_id)
            .is_some_and(|block| nsu > block.position_at_rejection);
        if passed_block {
            inner.quota.remove(taxpayer_id);
        }
        Ok(())
    }

    async fn cursor_writes(&self, taxpayer_id: &str) -> SyncResult<u64> {
        let inner = self.read()?;
        Ok(inner.cursors.get(taxpayer_id).map(|c| c.writes).unwrap_or(0))
    }

    async fn get_quota_block(&self, taxpayer_id: &str) -> SyncResult<Option<QuotaBlock>> {
        Ok(self.read()?.quota.get(taxpayer_id).cloned())
    }

    async fn put_quota_block(&self, block: &QuotaBlock) -> SyncResult<()> {
        self.write()?
            .quota
            .insert(block.taxpayer_id.clone(), block.clone());
        Ok(())
    }

    async fn clear_quota_block(&self, taxpayer_id: &str) -> SyncResult<()> {
        self.write()?.quota.remove(taxpayer_id);
        Ok(())
    }

    async fn reset_all(&self, taxpayer_id: &str, _now: DateTime<Utc>) -> SyncResult<()> {
        let mut inner = self.write()?;
        let entry = inner
            .cursors
            .entry(taxpayer_id.to_string())
            .or_insert(StoredCursor {
                nsu: Nsu::ZERO,
                writes: 0,
            });
        entry.nsu = Nsu::ZERO;
        entry.writes += 1;
        inner.quota.remove(taxpayer_id);
        inner.jobs.retain(|_, j| j.taxpayer_id != taxpayer_id);
        Ok(())
    }

    async fn upsert_document(
        &self,
        doc: &DocumentRecord,
        _now: DateTime<Utc>,
    ) -> SyncResult<UpsertOutcome> {
        let mut inner = self.write()?;

        let existing = inner.documents.get(&doc.doc_key).map(|d| (d.kind, d.status));
        let cancelled_by_event = doc.kind != DocumentKind::Event
            && inner
                .documents
                .values()
                .any(|d| d.access_key == doc.access_key && is_cancellation(d));

        let outcome = match plan_upsert(existing, doc, cancelled_by_event) {
            Some((outcome, kind, status)) => {
                let mut stored = doc.clone();
                stored.kind = kind;
                stored.status = status;
                inner.documents.insert(doc.doc_key.clone(), stored);
                outcome
            }
            None => UpsertOutcome::Unchanged,
        };

        if is_cancellation(doc) {
            for d in inner.documents.values_mut() {
                if d.access_key == doc.access_key && d.kind != DocumentKind::Event {
                    d.status = DocumentStatus::Cancelled;
                }
            }
        }

        Ok(outcome)
    }

    async fn get_document(&self, doc_key: &str) -> SyncResult<Option<DocumentRecord>> {
        Ok(self.read()?.documents.get(doc_key).cloned())
    }

    async fn list_documents(
        &self,
        taxpayer_id: &str,
        kind: Option<DocumentKind>,
    ) -> SyncResult<Vec<DocumentRecord>> {
        let inner = self.read()?;
        let mut docs: Vec<DocumentRecord> = inner
            .documents
            .values()
            .filter(|d| d.taxpayer_id == taxpayer_id)
            .filter(|d| match kind {
                Some(k) => d.kind == k,
                None => d.kind != DocumentKind::Event,
            })
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.nsu.cmp(&b.nsu).then_with(|| a.doc_key.cmp(&b.doc_key)));
        Ok(docs)
    }

    async fn document_counts(&self, taxpayer_id: &str) -> SyncResult<DocumentCounts> {
        let inner = self.read()?;
        let mut counts = DocumentCounts::default();
        for d in inner.documents.values().filter(|d| d.taxpayer_id == taxpayer_id) {
            match d.kind {
                DocumentKind::Full => counts.full += 1,
                DocumentKind::Summary => counts.summary += 1,
                DocumentKind::Event => counts.events += 1,
            }
        }
        Ok(counts)
    }

    async fn save_job(&self, job: &JobState) -> SyncResult<()> {
        self.write()?.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> SyncResult<Option<JobState>> {
        Ok(self.read()?.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self, taxpayer_id: Option<&str>) -> SyncResult<Vec<JobState>> {
        let inner = self.read()?;
        let mut jobs: Vec<JobState> = inner
            .jobs
            .values()
            .filter(|j| taxpayer_id.map_or(true, |t| j.taxpayer_id == t))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(jobs)
    }

    async fn delete_job(&self, job_id: &str) -> SyncResult<()> {
        self.write()?.jobs.remove(job_id);
        Ok(())
    }

    async fn record_key_lookup(&self, taxpayer_id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        self.write()?.lookups.push((taxpayer_id.to_string(), at));
        Ok(())
    }

    async fn key_lookups_since(
        &self,
        taxpayer_id: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<DateTime<Utc>>> {
        let inner = self.read()?;
        let mut out: Vec<DateTime<Utc>> = inner
            .lookups
            .iter()
            .filter(|(t, at)| t == taxpayer_id && *at >= since)
            .map(|(_, at)| *at)
            .collect();
        out.sort();
        Ok(out)
    }

    async fn prune_key_lookups(&self, before: DateTime<Utc>) -> SyncResult<()> {
        self.write()?.lookups.retain(|(_, at)| *at >= before);
        Ok(())
    }
}
