//! Targeted backfill: fetch full documents one access key at a time.
//!
//! The cursor feed often delivers only a summary of a document. A backfill
//! job walks an ordered list of access keys (by default every SUMMARY on
//! file) and asks the by-key query for each full body, promoting the stored
//! row when the full document comes back.
//!
//! Jobs are resumable. Progress is checkpointed every `checkpoint_every`
//! items and whenever the job stops early; resuming skips the items
//! already done. A quota rejection suspends the whole job and stamps it
//! with the time it may call the authority again; resuming earlier is a
//! no-op that reports the remaining wait.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::{classify, ClassifiedDoc};
use crate::clock::Clock;
use crate::config::{BackfillConfig, SyncConfig};
use crate::engine::CancelToken;
use crate::error::{SyncError, SyncResult};
use crate::models::{AccessKey, DocumentKind, JobState, JobStatus, Taxpayer, UpsertOutcome};
use crate::progress::{NoProgress, SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::protocol::{DistQuery, DistStatus, DistributionResponse, DistributionService};
use crate::ratelimit::{Admission, KeyRateLimiter};
use crate::store::SyncStore;
use crate::unpack::{unpack, UnpackedDoc};

/// A full document returned by the by-key query.
#[derive(Debug, Clone)]
pub struct FetchedDoc {
    pub doc: UnpackedDoc,
    pub classified: ClassifiedDoc,
}

/// Result of one by-key query.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Full(Box<FetchedDoc>),
    /// The authority only has the summary (or an event) for this key.
    SummaryOnly,
    NotFound,
    /// Local hourly budget exhausted or server-side rate limit.
    QuotaExceeded { retry_after: Duration },
    /// The certificate may not read this document.
    NoPermission,
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Suspended { retry_after: Duration },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub job_id: String,
    pub outcome: JobOutcome,
    pub items_total: u64,
    pub items_done: u64,
    pub promoted: u64,
    pub skipped: u64,
}

/// A 656 on the key path is ambiguous: it is also returned when the
/// authority holds only the summary. The reason text is the only signal.
/// Matching on it is fragile and breaks if the wording changes.
fn is_summary_only_rejection(reason: &str) -> bool {
    reason.to_lowercase().contains("resumo")
}

pub struct Backfiller {
    store: Arc<dyn SyncStore>,
    service: Arc<dyn DistributionService>,
    limiter: KeyRateLimiter,
    clock: Arc<dyn Clock>,
    checkpoint_every: u64,
    server_cooldown: Duration,
    progress: Arc<dyn SyncProgressReporter>,
}

impl Backfiller {
    pub fn new(
        store: Arc<dyn SyncStore>,
        service: Arc<dyn DistributionService>,
        clock: Arc<dyn Clock>,
        backfill: &BackfillConfig,
        sync: &SyncConfig,
    ) -> Self {
        Self {
            limiter: KeyRateLimiter::from_config(store.clone(), clock.clone(), backfill),
            store,
            service,
            clock,
            checkpoint_every: backfill.checkpoint_every.max(1),
            server_cooldown: sync.cooldown().to_std().unwrap_or(Duration::ZERO),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Query one access key, honoring the by-key rate limit.
    pub async fn fetch_by_key(
        &self,
        taxpayer: &Taxpayer,
        key: &AccessKey,
    ) -> SyncResult<FetchOutcome> {
        if let Admission::Exhausted { retry_after } = self.limiter.acquire(&taxpayer.tax_id).await? {
            return Ok(FetchOutcome::QuotaExceeded { retry_after });
        }

        let response = self
            .service
            .distribute(taxpayer, &DistQuery::AccessKey(key.clone()))
            .await?;
        self.interpret(key, response)
    }

    fn interpret(&self, key: &AccessKey, response: DistributionResponse) -> SyncResult<FetchOutcome> {
        match response.status {
            DistStatus::DocumentsFound => {
                for entry in &response.entries {
                    let doc = match unpack(entry) {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(key = %key, error = %e, "skipping undecodable entry");
                            continue;
                        }
                    };
                    match classify(&doc.xml, Some(doc.schema.as_str())) {
                        Ok(c) if c.kind == DocumentKind::Full => {
                            return Ok(FetchOutcome::Full(Box::new(FetchedDoc {
                                doc,
                                classified: c,
                            })));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(key = %key, error = %e, "skipping unclassifiable entry"),
                    }
                }
                Ok(FetchOutcome::SummaryOnly)
            }
            DistStatus::NoDocuments | DistStatus::NotFound => Ok(FetchOutcome::NotFound),
            DistStatus::RateLimited if is_summary_only_rejection(&response.reason) => {
                debug!(key = %key, reason = %response.reason, "656 read as summary-only");
                Ok(FetchOutcome::SummaryOnly)
            }
            DistStatus::RateLimited => Ok(FetchOutcome::QuotaExceeded {
                retry_after: self.server_cooldown,
            }),
            DistStatus::PermissionDenied => Ok(FetchOutcome::NoPermission),
            DistStatus::Other(code) => Err(SyncError::Protocol(format!(
                "unexpected status {} for key {}: {}",
                code, key, response.reason
            ))),
        }
    }

    /// Create and persist a job. Without explicit keys the job covers every
    /// SUMMARY document of the taxpayer, in NSU order.
    pub async fn create_job(
        &self,
        taxpayer_id: &str,
        keys: Option<Vec<String>>,
    ) -> SyncResult<JobState> {
        let keys = match keys {
            Some(explicit) => {
                let mut seen = std::collections::HashSet::new();
                explicit
                    .into_iter()
                    .filter(|k| seen.insert(k.clone()))
                    .collect()
            }
            None => self
                .store
                .list_documents(taxpayer_id, Some(DocumentKind::Summary))
                .await?
                .into_iter()
                .map(|d| d.access_key.as_str().to_string())
                .collect::<Vec<_>>(),
        };

        let now = self.clock.now();
        let job = JobState {
            job_id: uuid::Uuid::new_v4().to_string(),
            taxpayer_id: taxpayer_id.to_string(),
            items_total: keys.len() as u64,
            keys,
            items_done: 0,
            last_item_processed: None,
            started_at: now,
            updated_at: now,
            status: JobStatus::Running,
            resume_after: None,
        };
        self.store.save_job(&job).await?;
        info!(taxpayer = taxpayer_id, job = %job.job_id, items = job.items_total, "backfill job created");
        Ok(job)
    }

    /// Run a job from its checkpoint until it completes, is suspended or is
    /// cancelled. Completed jobs are deleted.
    pub async fn run_job(
        &self,
        taxpayer: &Taxpayer,
        mut job: JobState,
        cancel: &CancelToken,
    ) -> SyncResult<BackfillReport> {
        let mut promoted = 0u64;
        let mut skipped = 0u64;

        if let Some(at) = job.resume_after {
            let now = self.clock.now();
            if at > now {
                let retry_after = (at - now).to_std().unwrap_or(Duration::ZERO);
                debug!(job = %job.job_id, retry_secs = retry_after.as_secs(), "backfill job still cooling down");
                return Ok(report(&job, JobOutcome::Suspended { retry_after }, 0, 0));
            }
            job.resume_after = None;
        }

        if job.status != JobStatus::Running {
            job.status = JobStatus::Running;
            job.updated_at = self.clock.now();
            self.store.save_job(&job).await?;
        }
        if job.items_done > 0 {
            info!(job = %job.job_id, from = job.items_done + 1, "resuming backfill job");
        }

        while job.items_done < job.items_total {
            if cancel.is_cancelled() {
                self.suspend(&mut job).await?;
                return Ok(report(&job, JobOutcome::Cancelled, promoted, skipped));
            }

            let key_str = job.keys[job.items_done as usize].clone();
            let outcome = match AccessKey::parse(&key_str) {
                Ok(key) => match self.fetch_by_key(taxpayer, &key).await {
                    Ok(o) => Some(o),
                    Err(e) => {
                        self.suspend(&mut job).await?;
                        return Err(e);
                    }
                },
                Err(e) => {
                    warn!(job = %job.job_id, key = %key_str, error = %e, "skipping invalid key");
                    None
                }
            };

            match outcome {
                Some(FetchOutcome::Full(fetched)) => {
                    let FetchedDoc { doc, classified } = *fetched;
                    let record =
                        classified.into_record(&taxpayer.tax_id, doc.nsu, Some(doc.schema), doc.xml);
                    match self.store.upsert_document(&record, self.clock.now()).await? {
                        UpsertOutcome::Promoted => promoted += 1,
                        UpsertOutcome::Unchanged => skipped += 1,
                        UpsertOutcome::Inserted | UpsertOutcome::Updated => {}
                    }
                }
                Some(FetchOutcome::QuotaExceeded { retry_after }) => {
                    job.resume_after = Some(
                        self.clock.now()
                            + chrono::Duration::from_std(retry_after)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    self.suspend(&mut job).await?;
                    info!(
                        job = %job.job_id,
                        items_done = job.items_done,
                        retry_minutes = retry_after.as_secs().div_ceil(60),
                        "backfill suspended on quota"
                    );
                    return Ok(report(
                        &job,
                        JobOutcome::Suspended { retry_after },
                        promoted,
                        skipped,
                    ));
                }
                Some(other) => {
                    debug!(job = %job.job_id, key = %key_str, outcome = ?other, "key skipped");
                    skipped += 1;
                }
                None => skipped += 1,
            }

            job.items_done += 1;
            job.last_item_processed = Some(key_str);
            job.updated_at = self.clock.now();
            if job.items_done % self.checkpoint_every == 0 {
                self.store.save_job(&job).await?;
            }
            self.progress.report(SyncProgressEvent {
                taxpayer_id: taxpayer.tax_id.clone(),
                phase: SyncPhase::Backfilling,
                n: job.items_done,
                total: Some(job.items_total),
                message: format!("{} promoted", promoted),
            });
        }

        self.store.delete_job(&job.job_id).await?;
        info!(job = %job.job_id, promoted, skipped, "backfill job completed");
        Ok(report(&job, JobOutcome::Completed, promoted, skipped))
    }

    /// Load a stored job and continue it.
    pub async fn resume_job(
        &self,
        taxpayer: &Taxpayer,
        job_id: &str,
        cancel: &CancelToken,
    ) -> SyncResult<Option<BackfillReport>> {
        let job = match self.store.load_job(job_id).await? {
            Some(j) if j.taxpayer_id == taxpayer.tax_id => j,
            _ => return Ok(None),
        };
        self.run_job(taxpayer, job, cancel).await.map(Some)
    }

    async fn suspend(&self, job: &mut JobState) -> SyncResult<()> {
        job.status = JobStatus::Suspended;
        job.updated_at = self.clock.now();
        self.store.save_job(job).await
    }
}

fn report(job: &JobState, outcome: JobOutcome, promoted: u64, skipped: u64) -> BackfillReport {
    BackfillReport {
        job_id: job.job_id.clone(),
        outcome,
        items_total: job.items_total,
        items_done: job.items_done,
        promoted,
        skipped,
    }
}
