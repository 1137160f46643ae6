//! Core data models used throughout the sync engine.
//!
//! These types represent the cursor positions, access keys, documents and
//! job snapshots that flow between the protocol codec, the classifier and
//! the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Width of an NSU on the wire.
pub const NSU_WIDTH: usize = 15;

/// Length of an access key.
pub const ACCESS_KEY_LEN: usize = 44;

/// A position in the distribution feed (15-digit, zero-padded on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Nsu(u64);

impl Nsu {
    pub const ZERO: Nsu = Nsu(0);

    pub fn new(value: u64) -> Self {
        Nsu(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Nsu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

impl FromStr for Nsu {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > NSU_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::Protocol(format!("invalid NSU '{}'", s)));
        }
        s.parse::<u64>()
            .map(Nsu)
            .map_err(|e| SyncError::Protocol(format!("invalid NSU '{}': {}", s, e)))
    }
}

/// 44-digit access key identifying a fiscal document.
///
/// The key embeds the issuer's state, the emission year-month, the issuer's
/// tax id, the document model, series and number at fixed offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        let s = s.trim();
        let s = s.strip_prefix("NFe").or_else(|| s.strip_prefix("CTe")).unwrap_or(s);
        if s.len() != ACCESS_KEY_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::Decode(format!("invalid access key '{}'", s)));
        }
        Ok(AccessKey(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Emitter CNPJ (or zero-padded CPF), `[6,20)`.
    pub fn issuer_id(&self) -> &str {
        &self.0[6..20]
    }

    /// Document model (55 = NF-e, 65 = NFC-e, 57 = CT-e), `[20,22)`.
    pub fn model(&self) -> &str {
        &self.0[20..22]
    }

    /// Series, `[22,25)`.
    pub fn series(&self) -> &str {
        &self.0[22..25]
    }

    /// Document number, `[25,34)`.
    pub fn number(&self) -> &str {
        &self.0[25..34]
    }

    /// Emission year-month, `[2,6)` as `YYMM`, rendered `YYYY-MM`.
    pub fn emission_month(&self) -> String {
        format!("20{}-{}", &self.0[2..4], &self.0[4..6])
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authority environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Homologation,
}

impl Environment {
    /// `tpAmb` value on the wire.
    pub fn tp_amb(&self) -> &'static str {
        match self {
            Environment::Production => "1",
            Environment::Homologation => "2",
        }
    }
}

/// A registered taxpayer whose documents are harvested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxpayer {
    /// CNPJ (14 digits) or CPF (11 digits).
    pub tax_id: String,
    /// Two-digit IBGE code of the authorizing state.
    pub uf_code: String,
    pub name: Option<String>,
}

impl Taxpayer {
    pub fn is_cpf(&self) -> bool {
        self.tax_id.len() == 11
    }
}

/// Classification of a distributed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DocumentKind {
    /// Complete signed document with authorization protocol.
    Full,
    /// Existence notice only.
    Summary,
    /// Lifecycle notice referencing another document.
    Event,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Full => "FULL",
            DocumentKind::Summary => "SUMMARY",
            DocumentKind::Event => "EVENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Some(DocumentKind::Full),
            "SUMMARY" => Some(DocumentKind::Summary),
            "EVENT" => Some(DocumentKind::Event),
            _ => None,
        }
    }

    /// Decide what an upsert of `incoming` over an existing row of kind
    /// `existing` may write.
    ///
    /// Returns `None` when the incoming document must not touch the row.
    pub fn merge(existing: Option<DocumentKind>, incoming: DocumentKind) -> Option<DocumentKind> {
        use DocumentKind::*;
        match (existing, incoming) {
            (None, k) => Some(k),
            (Some(Event), Event) => Some(Event),
            (Some(Event), _) | (Some(_), Event) => None,
            (Some(Full), Summary) => None,
            (Some(Summary), Summary) => Some(Summary),
            (Some(_), Full) => Some(Full),
        }
    }
}

/// Display status of a document. Events change this, never the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Authorized,
    Denied,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Authorized => "authorized",
            DocumentStatus::Denied => "denied",
            DocumentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "denied" => DocumentStatus::Denied,
            "cancelled" => DocumentStatus::Cancelled,
            _ => DocumentStatus::Authorized,
        }
    }

    /// Map `cSitNFe` (1 authorized, 2 denied, 3 cancelled).
    pub fn from_sit_code(code: &str) -> Self {
        match code.trim() {
            "2" => DocumentStatus::Denied,
            "3" => DocumentStatus::Cancelled,
            _ => DocumentStatus::Authorized,
        }
    }
}

/// Document row as persisted by a [`SyncStore`](crate::store::SyncStore).
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Store key: the access key for FULL/SUMMARY, the event id for EVENT.
    pub doc_key: String,
    pub access_key: AccessKey,
    pub kind: DocumentKind,
    pub taxpayer_id: String,
    pub nsu: Nsu,
    pub schema: Option<String>,
    pub raw_xml: String,
    pub number: String,
    pub series: String,
    pub model: String,
    /// Emission timestamp (RFC 3339) or `YYYY-MM` when only the key is known.
    pub issued_at: String,
    pub counterparty_id: String,
    pub counterparty_name: Option<String>,
    pub total_value: Option<String>,
    pub event_type: Option<String>,
    pub status: DocumentStatus,
    pub content_hash: String,
}

/// Outcome of a document upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// SUMMARY row replaced by a FULL document.
    Promoted,
    /// Row left untouched (protected kind or downgrade).
    Unchanged,
}

/// A persisted quota rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBlock {
    pub taxpayer_id: String,
    pub rejected_at: DateTime<Utc>,
    pub position_at_rejection: Nsu,
}

impl QuotaBlock {
    /// Time left in the cool-down window, or `None` once it has elapsed.
    pub fn remaining(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> Option<chrono::Duration> {
        let until = self.rejected_at + cooldown;
        if now < until {
            Some(until - now)
        } else {
            None
        }
    }
}

/// Lifecycle status of a resumable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Suspended,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "suspended" => JobStatus::Suspended,
            _ => JobStatus::Running,
        }
    }
}

/// Persisted snapshot of a targeted backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub job_id: String,
    pub taxpayer_id: String,
    /// Ordered key set being processed.
    pub keys: Vec<String>,
    pub items_total: u64,
    pub items_done: u64,
    pub last_item_processed: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Earliest time a suspended job may call the authority again.
    pub resume_after: Option<DateTime<Utc>>,
}
