//! Sync orchestrator.
//!
//! Drives one cursor cycle per taxpayer through a small state machine:
//!
//! ```text
//! Idle ─▶ CheckBlock ─▶ Fetching ─▶ Classifying ─▶ Persisting ─┬▶ Fetching
//!             │            │                                   ├▶ Done
//!             ▼            ├▶ Blocked (656)                    └▶ Cancelled
//!          Blocked         ├▶ Failed (permission, transport, malformed)
//!                          └▶ Done (137, batch cap)
//! ```
//!
//! Each batch is persisted before the cursor moves, so a crash between the
//! two steps only makes the next cycle re-read documents that are already
//! stored. Cycles for different taxpayers run in a bounded pool; cycles for
//! the same taxpayer are serialized by a per-taxpayer lock that the backfill
//! path shares.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backfill::{BackfillReport, Backfiller};
use crate::classify::classify;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{BlockStatus, Ledger};
use crate::models::{DocumentRecord, Nsu, Taxpayer};
use crate::progress::{NoProgress, SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::protocol::{DistQuery, DistStatus, DistributionResponse, DistributionService};
use crate::store::SyncStore;
use crate::unpack::unpack;

/// Shared cancellation flag, checked between batches and between backfill items.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// States of a single cursor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    CheckBlock,
    Fetching,
    Classifying,
    Persisting,
    Done,
    Blocked,
    Failed,
    Cancelled,
}

impl CycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleState::Done | CycleState::Blocked | CycleState::Failed | CycleState::Cancelled
        )
    }
}

/// Terminal state of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Done,
    Blocked,
    Failed,
    Cancelled,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Done => "done",
            CycleOutcome::Blocked => "blocked",
            CycleOutcome::Failed => "failed",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

/// Summary of one taxpayer cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub taxpayer_id: String,
    pub outcome: CycleOutcome,
    pub last_nsu: Nsu,
    pub max_nsu: Option<Nsu>,
    pub documents_found: u64,
    pub documents_failed: u64,
    pub quota_blocked: bool,
    /// Time left on the quota block when the cycle ended blocked.
    pub retry_after: Option<Duration>,
    pub reason: Option<String>,
    /// Summary promotion run after a clean cycle, when enabled.
    pub backfill: Option<BackfillReport>,
}

impl CycleReport {
    fn new(taxpayer_id: &str) -> Self {
        Self {
            taxpayer_id: taxpayer_id.to_string(),
            outcome: CycleOutcome::Failed,
            last_nsu: Nsu::ZERO,
            max_nsu: None,
            documents_found: 0,
            documents_failed: 0,
            quota_blocked: false,
            retry_after: None,
            reason: None,
            backfill: None,
        }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {}  nsu {}",
            self.taxpayer_id,
            self.outcome.as_str(),
            self.last_nsu
        )?;
        if let Some(max) = self.max_nsu {
            write!(f, " / {}", max)?;
        }
        write!(
            f,
            "  found {}  failed {}",
            self.documents_found, self.documents_failed
        )?;
        if let Some(retry) = self.retry_after {
            write!(f, "  try again in {} minutes", retry.as_secs().div_ceil(60))?;
        } else if let Some(reason) = &self.reason {
            write!(f, "  ({})", reason)?;
        }
        Ok(())
    }
}

pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    service: Arc<dyn DistributionService>,
    ledger: Ledger,
    backfiller: Backfiller,
    clock: Arc<dyn Clock>,
    max_batches: u32,
    max_workers: usize,
    auto_backfill: bool,
    progress: Arc<dyn SyncProgressReporter>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn SyncStore>,
        service: Arc<dyn DistributionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: Ledger::new(store.clone(), clock.clone(), config.sync.cooldown()),
            backfiller: Backfiller::new(
                store.clone(),
                service.clone(),
                clock.clone(),
                &config.backfill,
                &config.sync,
            ),
            clock,
            store,
            service,
            max_batches: config.sync.max_batches_per_cycle.max(1),
            max_workers: config.sync.max_workers.max(1),
            auto_backfill: config.backfill.auto_after_sync,
            progress: Arc::new(NoProgress),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.backfiller = self.backfiller.with_progress(progress.clone());
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn is_blocked(&self, taxpayer_id: &str) -> SyncResult<BlockStatus> {
        self.ledger.is_blocked(taxpayer_id).await
    }

    fn taxpayer_lock(&self, taxpayer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(taxpayer_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one cycle for a taxpayer. Never fails: errors end up in the
    /// report as a `Failed` outcome.
    pub async fn sync_taxpayer(
        &self,
        taxpayer: &Taxpayer,
        full: bool,
        cancel: &CancelToken,
    ) -> CycleReport {
        let lock = self.taxpayer_lock(&taxpayer.tax_id);
        let _guard = lock.lock().await;

        let mut report = CycleReport::new(&taxpayer.tax_id);
        match self.run_cycle(taxpayer, full, cancel, &mut report).await {
            Ok(outcome) => report.outcome = outcome,
            Err(e) => {
                warn!(taxpayer = %taxpayer.tax_id, error = %e, "sync cycle failed");
                report.outcome = if matches!(e, SyncError::Cancelled) {
                    CycleOutcome::Cancelled
                } else {
                    CycleOutcome::Failed
                };
                report.reason = Some(e.to_string());
            }
        }

        if report.outcome == CycleOutcome::Done && self.auto_backfill {
            match self.promote_summaries(taxpayer, cancel).await {
                Ok(b) => report.backfill = b,
                Err(e) => warn!(taxpayer = %taxpayer.tax_id, error = %e, "summary promotion failed"),
            }
        }

        info!(
            taxpayer = %taxpayer.tax_id,
            outcome = report.outcome.as_str(),
            last_nsu = %report.last_nsu,
            found = report.documents_found,
            failed = report.documents_failed,
            "sync cycle finished"
        );
        report
    }

    async fn run_cycle(
        &self,
        taxpayer: &Taxpayer,
        full: bool,
        cancel: &CancelToken,
        report: &mut CycleReport,
    ) -> SyncResult<CycleOutcome> {
        let tp = taxpayer.tax_id.as_str();
        if full {
            self.ledger.reset_all(tp).await?;
        }

        let mut cursor = self.ledger.get_cursor(tp).await?;
        report.last_nsu = cursor;

        let mut state = CycleState::Idle;
        let mut batches = 0u32;
        let mut response: Option<DistributionResponse> = None;
        let mut records: Vec<DocumentRecord> = Vec::new();

        while !state.is_terminal() {
            debug!(taxpayer = tp, state = ?state, cursor = %cursor, "cycle step");
            state = match state {
                CycleState::Idle => CycleState::CheckBlock,

                CycleState::CheckBlock => self.check_block(tp, report).await?,

                CycleState::Fetching => {
                    if cancel.is_cancelled() {
                        CycleState::Cancelled
                    } else if batches >= self.max_batches {
                        info!(taxpayer = tp, batches, "batch cap reached, ending cycle");
                        CycleState::Done
                    } else {
                        let resp = self
                            .service
                            .distribute(taxpayer, &DistQuery::Cursor(cursor))
                            .await?;
                        batches += 1;
                        report.max_nsu = resp.max_nsu.or(report.max_nsu);
                        self.on_response(tp, &mut cursor, resp, &mut response, report)
                            .await?
                    }
                }

                CycleState::Classifying => {
                    records.clear();
                    if let Some(resp) = &response {
                        for entry in &resp.entries {
                            let classified = unpack(entry).and_then(|doc| {
                                classify(&doc.xml, Some(doc.schema.as_str())).map(|c| {
                                    c.into_record(tp, doc.nsu, Some(doc.schema), doc.xml)
                                })
                            });
                            match classified {
                                Ok(record) => records.push(record),
                                Err(e) if e.is_per_document() => {
                                    warn!(taxpayer = tp, nsu = %entry.nsu, error = %e, "skipping document");
                                    report.documents_failed += 1;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                    CycleState::Persisting
                }

                CycleState::Persisting => {
                    let resp = response.take().ok_or_else(|| {
                        SyncError::Protocol("persisting without a response".into())
                    })?;
                    let sent = cursor;
                    for record in records.drain(..) {
                        self.store.upsert_document(&record, self.clock.now()).await?;
                        report.documents_found += 1;
                    }

                    let last = resp.last_nsu.unwrap_or(cursor);
                    self.ledger.advance_cursor(tp, last).await?;
                    cursor = last;
                    report.last_nsu = cursor;

                    self.progress.report(SyncProgressEvent {
                        taxpayer_id: tp.to_string(),
                        phase: SyncPhase::Syncing,
                        n: u64::from(batches),
                        total: None,
                        message: format!(
                            "nsu {} / {}",
                            cursor,
                            resp.max_nsu.unwrap_or(cursor)
                        ),
                    });

                    if resp.has_more() && last != sent {
                        CycleState::Fetching
                    } else {
                        if resp.has_more() {
                            warn!(taxpayer = tp, cursor = %cursor, "no progress from the feed, ending cycle");
                        }
                        CycleState::Done
                    }
                }

                terminal => terminal,
            };
        }

        Ok(match state {
            CycleState::Blocked => CycleOutcome::Blocked,
            CycleState::Cancelled => CycleOutcome::Cancelled,
            CycleState::Failed => CycleOutcome::Failed,
            _ => CycleOutcome::Done,
        })
    }

    async fn on_response(
        &self,
        tp: &str,
        cursor: &mut Nsu,
        resp: DistributionResponse,
        pending: &mut Option<DistributionResponse>,
        report: &mut CycleReport,
    ) -> SyncResult<CycleState> {
        match resp.status {
            DistStatus::DocumentsFound => {
                *pending = Some(resp);
                Ok(CycleState::Classifying)
            }
            DistStatus::NoDocuments => {
                let last = resp.last_nsu.unwrap_or(*cursor);
                self.ledger.advance_cursor(tp, last).await?;
                *cursor = last;
                report.last_nsu = last;
                Ok(CycleState::Done)
            }
            DistStatus::RateLimited => {
                let block = self.ledger.record_quota_rejection(tp, *cursor).await?;
                debug!(taxpayer = tp, position = %block.position_at_rejection, "rate limited");
                self.check_block(tp, report).await
            }
            DistStatus::PermissionDenied => Err(SyncError::PermissionDenied {
                code: resp.code,
                reason: resp.reason,
            }),
            DistStatus::NotFound | DistStatus::Other(_) => Err(SyncError::Protocol(format!(
                "unexpected status {} on cursor query: {}",
                resp.code, resp.reason
            ))),
        }
    }

    /// `Fetching` when the taxpayer may call the feed, `Blocked` otherwise.
    async fn check_block(&self, tp: &str, report: &mut CycleReport) -> SyncResult<CycleState> {
        match self.ledger.ensure_unblocked(tp).await {
            Ok(()) => Ok(CycleState::Fetching),
            Err(SyncError::QuotaExceeded { retry_after, .. }) => {
                self.mark_blocked(report, retry_after);
                Ok(CycleState::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    fn mark_blocked(&self, report: &mut CycleReport, remaining: Duration) {
        report.quota_blocked = true;
        report.retry_after = Some(remaining);
        report.reason = Some(format!(
            "quota blocked, try again in {} minutes",
            remaining.as_secs().div_ceil(60)
        ));
    }

    /// Run one cycle per taxpayer in a bounded pool. Reports come back in
    /// the order of `taxpayers`.
    pub async fn sync_all(
        self: &Arc<Self>,
        taxpayers: Vec<Taxpayer>,
        full: bool,
        cancel: &CancelToken,
    ) -> Vec<CycleReport> {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (idx, taxpayer) in taxpayers.iter().cloned().enumerate() {
            let engine = Arc::clone(self);
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (idx, engine.sync_taxpayer(&taxpayer, full, &cancel).await)
            });
        }

        let mut slots: Vec<Option<CycleReport>> = vec![None; taxpayers.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, report)) => slots[idx] = Some(report),
                Err(e) => warn!(error = %e, "sync task aborted"),
            }
        }

        slots
            .into_iter()
            .zip(taxpayers.iter())
            .map(|(slot, tp)| {
                slot.unwrap_or_else(|| {
                    let mut r = CycleReport::new(&tp.tax_id);
                    r.reason = Some("sync task aborted".into());
                    r
                })
            })
            .collect()
    }

    /// Start a targeted backfill. Without keys every SUMMARY is covered.
    pub async fn backfill(
        &self,
        taxpayer: &Taxpayer,
        keys: Option<Vec<String>>,
        cancel: &CancelToken,
    ) -> SyncResult<BackfillReport> {
        let lock = self.taxpayer_lock(&taxpayer.tax_id);
        let _guard = lock.lock().await;
        let job = self.backfiller.create_job(&taxpayer.tax_id, keys).await?;
        self.backfiller.run_job(taxpayer, job, cancel).await
    }

    /// Continue a suspended job. `None` when no such job exists for the taxpayer.
    pub async fn resume_backfill(
        &self,
        taxpayer: &Taxpayer,
        job_id: &str,
        cancel: &CancelToken,
    ) -> SyncResult<Option<BackfillReport>> {
        let lock = self.taxpayer_lock(&taxpayer.tax_id);
        let _guard = lock.lock().await;
        self.backfiller.resume_job(taxpayer, job_id, cancel).await
    }

    /// Continue the taxpayer's unfinished job if there is one, otherwise
    /// start a new one over the current summaries. Caller already holds the
    /// taxpayer lock.
    async fn promote_summaries(
        &self,
        taxpayer: &Taxpayer,
        cancel: &CancelToken,
    ) -> SyncResult<Option<BackfillReport>> {
        let pending = self.store.list_jobs(Some(&taxpayer.tax_id)).await?;
        if let Some(job) = pending.into_iter().next() {
            debug!(taxpayer = %taxpayer.tax_id, job = %job.job_id, "continuing unfinished backfill job");
            return self.backfiller.run_job(taxpayer, job, cancel).await.map(Some);
        }

        let job = self.backfiller.create_job(&taxpayer.tax_id, None).await?;
        if job.items_total == 0 {
            self.store.delete_job(&job.job_id).await?;
            return Ok(None);
        }
        self.backfiller.run_job(taxpayer, job, cancel).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::JobOutcome;
    use crate::clock::ManualClock;
    use crate::progress::RecordingProgress;
    use crate::models::{DocumentKind, DocumentStatus};
    use crate::protocol::DocZip;
    use crate::store::memory::InMemoryStore;
    use crate::unpack::pack;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;

    const TP: &str = "99999999000191";
    const KEY_A: &str = "35210112345678000195550010000000011234567890";
    const KEY_B: &str = "35210112345678000195550010000000021234567890";

    fn taxpayer() -> Taxpayer {
        Taxpayer {
            tax_id: TP.into(),
            uf_code: "35".into(),
            name: None,
        }
    }

    fn summary(key: &str) -> String {
        format!("<resNFe><chNFe>{}</chNFe><cSitNFe>1</cSitNFe></resNFe>", key)
    }

    fn full(key: &str) -> String {
        format!(
            r#"<nfeProc><NFe><infNFe Id="NFe{key}"><ide><nNF>1</nNF></ide></infNFe></NFe></nfeProc>"#
        )
    }

    fn cancellation(key: &str) -> String {
        format!(
            r#"<procEventoNFe><evento><infEvento Id="ID110111{key}01"><chNFe>{key}</chNFe><tpEvento>110111</tpEvento><nSeqEvento>1</nSeqEvento></infEvento></evento></procEventoNFe>"#
        )
    }

    fn zip(nsu: u64, xml: &str) -> DocZip {
        DocZip {
            nsu: Nsu::new(nsu),
            schema: "x.xsd".into(),
            payload: pack(xml),
        }
    }

    fn resp(code: &str, last: u64, max: u64, entries: Vec<DocZip>) -> DistributionResponse {
        DistributionResponse {
            status: DistStatus::from_code(code),
            code: code.into(),
            reason: String::new(),
            last_nsu: Some(Nsu::new(last)),
            max_nsu: Some(Nsu::new(max)),
            entries,
        }
    }

    /// Replays queued answers; answers 137 at the requested cursor when empty.
    #[derive(Default)]
    struct Scripted {
        queue: std::sync::Mutex<VecDeque<SyncResult<DistributionResponse>>>,
        cursors: std::sync::Mutex<Vec<Nsu>>,
        cancel_after_first: Option<CancelToken>,
        /// Answer key queries with 656 instead of 632.
        key_rate_limited: bool,
        key_calls: std::sync::Mutex<usize>,
    }

    impl Scripted {
        fn push(&self, r: SyncResult<DistributionResponse>) {
            self.queue.lock().unwrap().push_back(r);
        }

        fn cursors(&self) -> Vec<Nsu> {
            self.cursors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DistributionService for Scripted {
        async fn distribute(
            &self,
            _taxpayer: &Taxpayer,
            query: &DistQuery,
        ) -> SyncResult<DistributionResponse> {
            let cursor = match query {
                DistQuery::Cursor(n) => *n,
                DistQuery::AccessKey(_) => {
                    *self.key_calls.lock().unwrap() += 1;
                    let code = if self.key_rate_limited { "656" } else { "632" };
                    return Ok(resp(code, 0, 0, vec![]));
                }
            };
            self.cursors.lock().unwrap().push(cursor);
            if let Some(c) = &self.cancel_after_first {
                c.cancel();
            }
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(resp("137", cursor.value(), cursor.value(), vec![])))
        }
    }

    struct Fixture {
        engine: SyncEngine,
        store: Arc<InMemoryStore>,
        service: Arc<Scripted>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(service: Scripted, config: Config) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let service = Arc::new(service);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = SyncEngine::new(&config, store.clone(), service.clone(), clock.clone());
        Fixture {
            engine,
            store,
            service,
            clock,
        }
    }

    fn config() -> Config {
        Config::with_db_path(":memory:".into())
    }

    fn fixture() -> Fixture {
        fixture_with(Scripted::default(), config())
    }

    #[tokio::test]
    async fn first_sync_persists_and_advances() {
        let f = fixture();
        f.service.push(Ok(resp(
            "138",
            2,
            2,
            vec![zip(1, &summary(KEY_A)), zip(2, &full(KEY_B))],
        )));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(report.documents_found, 2);
        assert_eq!(report.last_nsu, Nsu::new(2));
        assert_eq!(f.store.get_cursor(TP).await.unwrap(), Nsu::new(2));
        assert_eq!(f.service.cursors(), vec![Nsu::ZERO]);
        assert_eq!(
            f.store.get_document(KEY_A).await.unwrap().unwrap().kind,
            DocumentKind::Summary
        );
    }

    #[tokio::test]
    async fn rate_limit_blocks_without_network_until_cooldown() {
        let f = fixture();
        f.store.advance_cursor(TP, Nsu::new(10), Utc::now()).await.unwrap();
        let mut limited = resp("656", 10, 10, vec![]);
        limited.reason = "Rejeicao: Consumo Indevido".into();
        f.service.push(Ok(limited));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Blocked);
        assert!(report.quota_blocked);
        assert_eq!(report.retry_after, Some(Duration::from_secs(65 * 60)));
        let block = f.store.get_quota_block(TP).await.unwrap().unwrap();
        assert_eq!(block.position_at_rejection, Nsu::new(10));

        f.clock.advance(chrono::Duration::minutes(10));
        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Blocked);
        assert_eq!(f.service.cursors().len(), 1);
        assert!(report.to_string().contains("try again in 55 minutes"));

        f.clock.advance(chrono::Duration::minutes(55));
        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(f.service.cursors().len(), 2);
    }

    #[tokio::test]
    async fn no_documents_still_writes_cursor() {
        let f = fixture();
        f.store.advance_cursor(TP, Nsu::new(50), Utc::now()).await.unwrap();
        let before = f.store.cursor_writes(TP).await.unwrap();

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(f.store.get_cursor(TP).await.unwrap(), Nsu::new(50));
        assert_eq!(f.store.cursor_writes(TP).await.unwrap(), before + 1);
    }

    #[tokio::test]
    async fn loops_while_more_is_available() {
        let f = fixture();
        f.service.push(Ok(resp("138", 1, 2, vec![zip(1, &summary(KEY_A))])));
        f.service.push(Ok(resp("138", 2, 2, vec![zip(2, &summary(KEY_B))])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(f.service.cursors(), vec![Nsu::ZERO, Nsu::new(1)]);
        assert_eq!(report.documents_found, 2);
        assert_eq!(report.max_nsu, Some(Nsu::new(2)));
    }

    #[tokio::test]
    async fn stalled_feed_ends_cycle() {
        let f = fixture();
        f.service.push(Ok(resp("138", 0, 9, vec![])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(f.service.cursors().len(), 1);
    }

    #[tokio::test]
    async fn repeated_position_is_written_twice_then_done() {
        let f = fixture();
        f.store.advance_cursor(TP, Nsu::new(10), Utc::now()).await.unwrap();
        let before = f.store.cursor_writes(TP).await.unwrap();
        f.service.push(Ok(resp("138", 20, 30, vec![zip(11, &summary(KEY_A))])));
        f.service.push(Ok(resp("138", 20, 30, vec![])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(f.service.cursors(), vec![Nsu::new(10), Nsu::new(20)]);
        assert_eq!(f.store.cursor_writes(TP).await.unwrap(), before + 2);
        assert_eq!(f.store.get_cursor(TP).await.unwrap(), Nsu::new(20));
    }

    #[tokio::test]
    async fn reports_progress_per_batch() {
        let f = fixture();
        let progress = Arc::new(RecordingProgress::default());
        let engine = f.engine.with_progress(progress.clone());
        f.service.push(Ok(resp("138", 1, 2, vec![zip(1, &summary(KEY_A))])));
        f.service.push(Ok(resp("138", 2, 2, vec![zip(2, &summary(KEY_B))])));

        engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        let events = progress.events();
        let ns: Vec<u64> = events.iter().map(|e| e.n).collect();
        assert_eq!(ns, vec![1, 2]);
        assert!(events
            .iter()
            .all(|e| e.phase == SyncPhase::Syncing && e.taxpayer_id == TP));
        assert_eq!(events[1].message, "nsu 000000000000002 / 000000000000002");
    }

    #[tokio::test]
    async fn batch_cap_ends_cycle() {
        let mut config = config();
        config.sync.max_batches_per_cycle = 2;
        let f = fixture_with(Scripted::default(), config);
        for n in 1..=5 {
            f.service.push(Ok(resp("138", n, 99, vec![])));
        }

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(report.last_nsu, Nsu::new(2));
        assert_eq!(f.service.cursors().len(), 2);
    }

    #[tokio::test]
    async fn bad_entry_does_not_abort_batch() {
        let f = fixture();
        let mut broken = zip(1, "");
        broken.payload = "%%%".into();
        f.service.push(Ok(resp("138", 2, 2, vec![broken, zip(2, &summary(KEY_A))])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Done);
        assert_eq!(report.documents_failed, 1);
        assert_eq!(report.documents_found, 1);
        assert_eq!(f.store.get_cursor(TP).await.unwrap(), Nsu::new(2));
    }

    #[tokio::test]
    async fn permission_denied_fails_without_moving_cursor() {
        let f = fixture();
        f.service.push(Ok(resp("640", 0, 0, vec![])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Failed);
        assert!(report.reason.unwrap().contains("640"));
        assert_eq!(f.store.cursor_writes(TP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_failure_fails_cycle() {
        let f = fixture();
        f.service.push(Err(SyncError::transport_fatal("connection reset")));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(report.outcome, CycleOutcome::Failed);
        assert!(f.store.get_quota_block(TP).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_batches() {
        let cancel = CancelToken::new();
        let service = Scripted {
            cancel_after_first: Some(cancel.clone()),
            ..Default::default()
        };
        let f = fixture_with(service, config());
        f.service.push(Ok(resp("138", 1, 5, vec![zip(1, &summary(KEY_A))])));
        f.service.push(Ok(resp("138", 5, 5, vec![])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(f.store.get_cursor(TP).await.unwrap(), Nsu::new(1));
        assert!(f.store.get_document(KEY_A).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn full_resync_starts_from_zero() {
        let f = fixture();
        f.store.advance_cursor(TP, Nsu::new(40), Utc::now()).await.unwrap();

        f.engine.sync_taxpayer(&taxpayer(), true, &CancelToken::new()).await;
        assert_eq!(f.service.cursors(), vec![Nsu::ZERO]);
    }

    #[tokio::test]
    async fn cancellation_event_flips_status_only() {
        let f = fixture();
        f.service.push(Ok(resp(
            "138",
            2,
            2,
            vec![zip(1, &full(KEY_A)), zip(2, &cancellation(KEY_A))],
        )));

        f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        let doc = f.store.get_document(KEY_A).await.unwrap().unwrap();
        assert_eq!(doc.kind, DocumentKind::Full);
        assert_eq!(doc.status, DocumentStatus::Cancelled);
        let counts = f.store.document_counts(TP).await.unwrap();
        assert_eq!((counts.full, counts.events), (1, 1));
    }

    #[tokio::test]
    async fn sync_all_isolates_taxpayers() {
        let f = fixture();
        f.service.push(Err(SyncError::transport_fatal("down")));
        let engine = Arc::new(f.engine);
        let other = Taxpayer {
            tax_id: "12345678000195".into(),
            uf_code: "35".into(),
            name: None,
        };

        let reports = engine
            .sync_all(vec![taxpayer(), other.clone()], false, &CancelToken::new())
            .await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].taxpayer_id, TP);
        assert_eq!(reports[1].taxpayer_id, other.tax_id);
        let outcomes: Vec<CycleOutcome> = reports.iter().map(|r| r.outcome).collect();
        assert!(outcomes.contains(&CycleOutcome::Failed));
        assert!(outcomes.contains(&CycleOutcome::Done));
    }

    #[tokio::test]
    async fn auto_backfill_runs_after_clean_cycle() {
        let mut config = config();
        config.backfill.auto_after_sync = true;
        config.backfill.min_interval_ms = 0;
        let f = fixture_with(Scripted::default(), config);
        f.service.push(Ok(resp("138", 1, 1, vec![zip(1, &summary(KEY_A))])));

        let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        let backfill = report.backfill.unwrap();
        assert_eq!(backfill.items_total, 1);
        assert_eq!(backfill.skipped, 1);
    }

    #[tokio::test]
    async fn auto_backfill_continues_the_same_job() {
        let mut config = config();
        config.backfill.auto_after_sync = true;
        config.backfill.min_interval_ms = 0;
        let service = Scripted {
            key_rate_limited: true,
            ..Default::default()
        };
        let f = fixture_with(service, config);
        f.service.push(Ok(resp(
            "138",
            2,
            2,
            vec![zip(1, &summary(KEY_A)), zip(2, &summary(KEY_B))],
        )));

        let mut job_ids = Vec::new();
        for _ in 0..3 {
            let report = f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
            assert_eq!(report.outcome, CycleOutcome::Done);
            let backfill = report.backfill.unwrap();
            assert!(matches!(backfill.outcome, JobOutcome::Suspended { .. }));
            assert_eq!(backfill.items_done, 0);
            job_ids.push(backfill.job_id);
        }
        assert!(job_ids.iter().all(|id| *id == job_ids[0]));
        assert_eq!(f.store.list_jobs(Some(TP)).await.unwrap().len(), 1);
        // Later cycles wait out the server cool-down instead of calling again
        assert_eq!(*f.service.key_calls.lock().unwrap(), 1);

        f.clock.advance(chrono::Duration::minutes(66));
        f.engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
        assert_eq!(*f.service.key_calls.lock().unwrap(), 2);
        assert_eq!(f.store.list_jobs(Some(TP)).await.unwrap().len(), 1);
    }
}
