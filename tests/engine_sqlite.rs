//! End-to-end engine runs against a temp-dir SQLite store and a scripted
//! distribution service.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use dfe_harvest::backfill::JobOutcome;
use dfe_harvest::clock::ManualClock;
use dfe_harvest::config::Config;
use dfe_harvest::db;
use dfe_harvest::engine::{CancelToken, CycleOutcome, SyncEngine};
use dfe_harvest::error::SyncResult;
use dfe_harvest::migrate;
use dfe_harvest::models::{DocumentKind, DocumentStatus, JobStatus, Nsu, Taxpayer};
use dfe_harvest::protocol::{
    DistQuery, DistStatus, DistributionResponse, DistributionService, DocZip,
};
use dfe_harvest::store::sqlite::SqliteStore;
use dfe_harvest::store::SyncStore;
use dfe_harvest::unpack::pack;

const TP: &str = "12345678000195";

fn key(n: u32) -> String {
    format!("352101987654320001915500100{:07}1234567890", n)
}

fn taxpayer() -> Taxpayer {
    Taxpayer {
        tax_id: TP.into(),
        uf_code: "35".into(),
        name: None,
    }
}

fn summary_xml(k: &str) -> String {
    format!(
        "<resNFe><chNFe>{}</chNFe><CNPJ>98765432000191</CNPJ><xNome>FORNECEDOR</xNome><vNF>10.00</vNF><cSitNFe>1</cSitNFe></resNFe>",
        k
    )
}

fn full_xml(k: &str) -> String {
    format!(
        r#"<nfeProc xmlns="http://www.portalfiscal.inf.br/nfe"><NFe><infNFe Id="NFe{k}"><ide><mod>55</mod><serie>1</serie><nNF>7</nNF><dhEmi>2021-01-20T08:00:00-03:00</dhEmi></ide><emit><CNPJ>98765432000191</CNPJ><xNome>FORNECEDOR</xNome></emit><total><ICMSTot><vNF>10.00</vNF></ICMSTot></total></infNFe></NFe><protNFe><infProt><chNFe>{k}</chNFe><cStat>100</cStat></infProt></protNFe></nfeProc>"#
    )
}

fn zip(nsu: u64, xml: &str) -> DocZip {
    DocZip {
        nsu: Nsu::new(nsu),
        schema: "resNFe_v1.01.xsd".into(),
        payload: pack(xml),
    }
}

fn response(code: &str, last: u64, max: u64, entries: Vec<DocZip>) -> DistributionResponse {
    DistributionResponse {
        status: DistStatus::from_code(code),
        code: code.into(),
        reason: String::new(),
        last_nsu: Some(Nsu::new(last)),
        max_nsu: Some(Nsu::new(max)),
        entries,
    }
}

/// Cursor queries replay a script; key queries return the full document.
#[derive(Default)]
struct FakeAuthority {
    script: Mutex<VecDeque<DistributionResponse>>,
    calls: Mutex<Vec<DistQuery>>,
}

impl FakeAuthority {
    fn then(&self, r: DistributionResponse) -> &Self {
        self.script.lock().unwrap().push_back(r);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DistributionService for FakeAuthority {
    async fn distribute(
        &self,
        _taxpayer: &Taxpayer,
        query: &DistQuery,
    ) -> SyncResult<DistributionResponse> {
        self.calls.lock().unwrap().push(query.clone());
        match query {
            DistQuery::Cursor(cursor) => Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| response("137", cursor.value(), cursor.value(), vec![]))),
            DistQuery::AccessKey(k) => Ok(response(
                "138",
                0,
                0,
                vec![zip(900, &full_xml(k.as_str()))],
            )),
        }
    }
}

struct Harness {
    _tmp: TempDir,
    config: Config,
    store: Arc<SqliteStore>,
    authority: Arc<FakeAuthority>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("data/dfe.sqlite"));
        config.backfill.min_interval_ms = 0;
        config.backfill.max_per_hour = 3;
        config.backfill.checkpoint_every = 1;
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        Self {
            _tmp: tmp,
            config,
            store: Arc::new(SqliteStore::new(pool)),
            authority: Arc::new(FakeAuthority::default()),
            clock: Arc::new(ManualClock::new(Utc::now())),
        }
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            &self.config,
            self.store.clone(),
            self.authority.clone(),
            self.clock.clone(),
        )
    }
}

#[tokio::test]
async fn first_sync_then_incremental() {
    let h = Harness::new().await;
    h.authority
        .then(response("138", 2, 3, vec![zip(1, &summary_xml(&key(1))), zip(2, &summary_xml(&key(2)))]))
        .then(response("138", 3, 3, vec![zip(3, &full_xml(&key(3)))]));

    let report = h
        .engine()
        .sync_taxpayer(&taxpayer(), false, &CancelToken::new())
        .await;
    assert_eq!(report.outcome, CycleOutcome::Done);
    assert_eq!(report.documents_found, 3);
    assert_eq!(h.store.get_cursor(TP).await.unwrap(), Nsu::new(3));

    let docs = h.store.list_documents(TP, None).await.unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[0].counterparty_name.as_deref(), Some("FORNECEDOR"));
    assert_eq!(docs[0].number, docs[0].access_key.number().trim_start_matches('0'));

    // A fresh engine on the same database resumes from the stored cursor
    let report = h
        .engine()
        .sync_taxpayer(&taxpayer(), false, &CancelToken::new())
        .await;
    assert_eq!(report.outcome, CycleOutcome::Done);
    assert_eq!(report.documents_found, 0);
    assert_eq!(h.authority.call_count(), 3);
}

#[tokio::test]
async fn redelivery_does_not_duplicate_and_full_wins() {
    let h = Harness::new().await;
    h.authority
        .then(response("138", 1, 1, vec![zip(1, &full_xml(&key(1)))]))
        .then(response("138", 2, 2, vec![zip(2, &summary_xml(&key(1)))]));

    let engine = h.engine();
    engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
    engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;

    let counts = h.store.document_counts(TP).await.unwrap();
    assert_eq!((counts.full, counts.summary), (1, 0));
    let doc = h.store.get_document(&key(1)).await.unwrap().unwrap();
    assert_eq!(doc.kind, DocumentKind::Full);
    assert_eq!(doc.nsu, Nsu::new(1));
}

#[tokio::test]
async fn quota_block_survives_restart() {
    let h = Harness::new().await;
    h.store.advance_cursor(TP, Nsu::new(10), Utc::now()).await.unwrap();
    h.authority.then(response("656", 10, 10, vec![]));

    let report = h
        .engine()
        .sync_taxpayer(&taxpayer(), false, &CancelToken::new())
        .await;
    assert_eq!(report.outcome, CycleOutcome::Blocked);

    h.clock.advance(chrono::Duration::minutes(30));
    let engine = h.engine();
    let status = engine.is_blocked(TP).await.unwrap();
    assert!(status.blocked);
    assert_eq!(status.remaining_minutes(), 35);

    let report = engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
    assert_eq!(report.outcome, CycleOutcome::Blocked);
    assert_eq!(h.authority.call_count(), 1);

    h.clock.advance(chrono::Duration::minutes(35));
    let report = engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;
    assert_eq!(report.outcome, CycleOutcome::Done);
    assert!(h.store.get_quota_block(TP).await.unwrap().is_none());
}

#[tokio::test]
async fn cancellation_event_marks_document_cancelled() {
    let h = Harness::new().await;
    let k = key(1);
    let event = format!(
        r#"<resEvento><chNFe>{k}</chNFe><tpEvento>110111</tpEvento><nSeqEvento>1</nSeqEvento><dhEvento>2021-01-21T10:00:00-03:00</dhEvento></resEvento>"#
    );
    h.authority
        .then(response("138", 2, 2, vec![zip(1, &summary_xml(&k)), zip(2, &event)]));

    h.engine()
        .sync_taxpayer(&taxpayer(), false, &CancelToken::new())
        .await;

    let doc = h.store.get_document(&k).await.unwrap().unwrap();
    assert_eq!(doc.kind, DocumentKind::Summary);
    assert_eq!(doc.status, DocumentStatus::Cancelled);
    assert_eq!(
        h.store
            .list_documents(TP, Some(DocumentKind::Event))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn backfill_suspends_and_resumes_on_sqlite() {
    let h = Harness::new().await;
    let entries = (1..=5)
        .map(|i| zip(i as u64, &summary_xml(&key(i))))
        .collect();
    h.authority.then(response("138", 5, 5, entries));

    let engine = h.engine();
    engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;

    let report = engine
        .backfill(&taxpayer(), None, &CancelToken::new())
        .await
        .unwrap();
    assert!(matches!(report.outcome, JobOutcome::Suspended { .. }));
    assert_eq!(report.items_done, 3);

    let jobs = h.store.list_jobs(Some(TP)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Suspended);
    assert_eq!(jobs[0].last_item_processed, Some(key(3)));

    h.clock.advance(chrono::Duration::minutes(61));
    let report = h
        .engine()
        .resume_backfill(&taxpayer(), &report.job_id, &CancelToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, JobOutcome::Completed);
    assert_eq!(report.promoted, 2);

    let counts = h.store.document_counts(TP).await.unwrap();
    assert_eq!((counts.full, counts.summary), (5, 0));
    assert!(h.store.list_jobs(None).await.unwrap().is_empty());

    // Every key was fetched exactly once
    let key_calls = h
        .authority
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|q| matches!(q, DistQuery::AccessKey(_)))
        .count();
    assert_eq!(key_calls, 5);
}

#[tokio::test]
async fn full_resync_clears_jobs_and_cursor() {
    let h = Harness::new().await;
    h.authority.then(response("138", 1, 1, vec![zip(1, &summary_xml(&key(1)))]));
    let engine = h.engine();
    engine.sync_taxpayer(&taxpayer(), false, &CancelToken::new()).await;

    let cancel = CancelToken::new();
    cancel.cancel();
    engine.backfill(&taxpayer(), None, &cancel).await.unwrap();
    assert_eq!(h.store.list_jobs(Some(TP)).await.unwrap().len(), 1);

    let report = engine.sync_taxpayer(&taxpayer(), true, &CancelToken::new()).await;
    assert_eq!(report.outcome, CycleOutcome::Done);
    assert!(h.store.list_jobs(Some(TP)).await.unwrap().is_empty());

    let cursors: Vec<Nsu> = h
        .authority
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter_map(|q| match q {
            DistQuery::Cursor(n) => Some(*n),
            DistQuery::AccessKey(_) => None,
        })
        .collect();
    assert_eq!(cursors, vec![Nsu::ZERO, Nsu::ZERO]);
}

/// Serves `total` summaries per taxpayer in batches of 50, from whatever
/// cursor is asked for.
struct GeneratedFeed {
    total: u64,
}

#[async_trait]
impl DistributionService for GeneratedFeed {
    async fn distribute(
        &self,
        taxpayer: &Taxpayer,
        query: &DistQuery,
    ) -> SyncResult<DistributionResponse> {
        let from = match query {
            DistQuery::Cursor(n) => n.value(),
            DistQuery::AccessKey(_) => return Ok(response("632", 0, 0, vec![])),
        };
        if from >= self.total {
            return Ok(response("137", from, self.total, vec![]));
        }
        let last = (from + 50).min(self.total);
        // Distinct keys per taxpayer: the tax id's last four digits go into the number
        let prefix: u32 = taxpayer.tax_id[10..].parse().unwrap_or(0);
        let entries = (from + 1..=last)
            .map(|n| zip(n, &summary_xml(&key(prefix * 1000 + n as u32))))
            .collect();
        Ok(response("138", last, self.total, entries))
    }
}

#[tokio::test]
async fn parallel_taxpayers_share_one_database() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("data/dfe.sqlite"));
    config.sync.max_workers = 8;
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));

    let engine = Arc::new(SyncEngine::new(
        &config,
        store.clone(),
        Arc::new(GeneratedFeed { total: 500 }),
        Arc::new(ManualClock::new(Utc::now())),
    ));
    let taxpayers: Vec<Taxpayer> = (1..=8)
        .map(|i| Taxpayer {
            tax_id: format!("1234567800{:04}", i),
            uf_code: "35".into(),
            name: None,
        })
        .collect();

    let reports = engine
        .sync_all(taxpayers.clone(), false, &CancelToken::new())
        .await;

    for report in &reports {
        assert_eq!(report.outcome, CycleOutcome::Done, "{}", report);
        assert_eq!(report.last_nsu, Nsu::new(500));
        assert_eq!(report.documents_found, 500);
    }
    for tp in &taxpayers {
        assert_eq!(store.get_cursor(&tp.tax_id).await.unwrap(), Nsu::new(500));
        assert_eq!(store.document_counts(&tp.tax_id).await.unwrap().summary, 500);
    }
}
