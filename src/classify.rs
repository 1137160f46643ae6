//! Document classifier.
//!
//! Decides whether an unpacked document is a full document, a summary or
//! a lifecycle event by looking at its root element, and pulls out the
//! identity fields the store needs. When a summary lacks a field, the value
//! is read from the fixed offsets of the access key instead.
//!
//! | Root element | Kind |
//! |--------------|------|
//! | `nfeProc`, `NFe`, `cteProc`, `CTe` | FULL |
//! | `resNFe`, `resCTe` | SUMMARY |
//! | `procEventoNFe`, `resEvento`, `evento`, `procEventoCTe`, `eventoCTe` | EVENT |

use std::collections::HashMap;

use quick_xml::events::Event;
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};
use crate::models::{AccessKey, DocumentKind, DocumentRecord, DocumentStatus, Nsu};

/// Identity fields extracted from one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedDoc {
    pub kind: DocumentKind,
    pub access_key: AccessKey,
    pub number: String,
    pub series: String,
    pub model: String,
    pub issued_at: String,
    pub counterparty_id: String,
    pub counterparty_name: Option<String>,
    pub total_value: Option<String>,
    pub status: DocumentStatus,
    pub event_type: Option<String>,
    pub event_id: Option<String>,
}

impl ClassifiedDoc {
    /// Store key: access key for documents, event id for events.
    pub fn doc_key(&self) -> String {
        match (&self.kind, &self.event_id) {
            (DocumentKind::Event, Some(id)) => id.clone(),
            (DocumentKind::Event, None) => format!(
                "ID{}{}",
                self.event_type.as_deref().unwrap_or("000000"),
                self.access_key
            ),
            _ => self.access_key.as_str().to_string(),
        }
    }

    pub fn into_record(
        self,
        taxpayer_id: &str,
        nsu: Nsu,
        schema: Option<String>,
        raw_xml: String,
    ) -> DocumentRecord {
        let content_hash = hex::encode(Sha256::digest(raw_xml.as_bytes()));
        DocumentRecord {
            doc_key: self.doc_key(),
            access_key: self.access_key,
            kind: self.kind,
            taxpayer_id: taxpayer_id.to_string(),
            nsu,
            schema,
            raw_xml,
            number: self.number,
            series: self.series,
            model: self.model,
            issued_at: self.issued_at,
            counterparty_id: self.counterparty_id,
            counterparty_name: self.counterparty_name,
            total_value: self.total_value,
            event_type: self.event_type,
            status: self.status,
            content_hash,
        }
    }
}

/// Kind from the `schema` attribute of the `docZip`, e.g. `resNFe_v1.01.xsd`.
fn kind_of_schema(schema: &str) -> Option<DocumentKind> {
    let name = schema.split('_').next().unwrap_or(schema);
    match name {
        "procNFe" | "procCTe" | "procCTeOS" => Some(DocumentKind::Full),
        "resNFe" | "resCTe" => Some(DocumentKind::Summary),
        "resEvento" | "procEventoNFe" | "procEventoCTe" => Some(DocumentKind::Event),
        _ => None,
    }
}

fn kind_of_root(root: &str) -> Option<DocumentKind> {
    match root {
        "nfeProc" | "NFe" | "cteProc" | "CTe" => Some(DocumentKind::Full),
        "resNFe" | "resCTe" => Some(DocumentKind::Summary),
        "procEventoNFe" | "resEvento" | "evento" | "procEventoCTe" | "eventoCTe" => {
            Some(DocumentKind::Event)
        }
        _ => None,
    }
}

/// Element texts and `Id` attributes collected in one pass.
#[derive(Default)]
struct Scan {
    root: Option<String>,
    /// First text seen per local name.
    first: HashMap<String, String>,
    /// First text seen per `parent/name`.
    scoped: HashMap<String, String>,
    /// First `Id` attribute seen per element local name.
    ids: HashMap<String, String>,
}

impl Scan {
    fn get(&self, name: &str) -> Option<&str> {
        self.first.get(name).map(String::as_str)
    }

    fn scoped(&self, parent: &str, name: &str) -> Option<&str> {
        self.scoped.get(&format!("{}/{}", parent, name)).map(String::as_str)
    }
}

fn scan(xml: &str) -> SyncResult<Scan> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Scan::default();
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if out.root.is_none() {
                    out.root = Some(name.clone());
                }
                collect_id(&mut out, &name, &e);
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if out.root.is_none() {
                    out.root = Some(name.clone());
                }
                collect_id(&mut out, &name, &e);
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| SyncError::Decode(format!("bad XML text: {}", e)))?
                    .into_owned();
                if let Some(name) = stack.last() {
                    out.first.entry(name.clone()).or_insert_with(|| text.clone());
                    if stack.len() >= 2 {
                        let parent = &stack[stack.len() - 2];
                        out.scoped
                            .entry(format!("{}/{}", parent, name))
                            .or_insert(text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SyncError::Decode(format!(
                    "malformed document XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(out)
}

fn collect_id(out: &mut Scan, name: &str, e: &quick_xml::events::BytesStart<'_>) {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"Id" {
            if let Ok(v) = attr.unescape_value() {
                out.ids.entry(name.to_string()).or_insert_with(|| v.into_owned());
            }
        }
    }
}

fn strip_zeros(s: &str) -> String {
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn access_key_of(scan: &Scan) -> SyncResult<AccessKey> {
    if let Some(k) = scan.get("chNFe").or_else(|| scan.get("chCTe")) {
        return AccessKey::parse(k);
    }
    for element in ["infNFe", "infCte"] {
        if let Some(id) = scan.ids.get(element) {
            return AccessKey::parse(id);
        }
    }
    Err(SyncError::Decode("document carries no access key".into()))
}

/// Classify a raw document and extract its identity fields.
///
/// The root element decides the kind; `schema_hint` is consulted only when
/// the root is not recognized.
pub fn classify(xml: &str, schema_hint: Option<&str>) -> SyncResult<ClassifiedDoc> {
    let scan = scan(xml)?;
    let root = scan
        .root
        .as_deref()
        .ok_or_else(|| SyncError::Decode("empty document".into()))?;
    let kind = kind_of_root(root)
        .or_else(|| schema_hint.and_then(kind_of_schema))
        .ok_or_else(|| SyncError::Decode(format!("unknown document root <{}>", root)))?;
    let key = access_key_of(&scan)?;

    let doc = match kind {
        DocumentKind::Full => classify_full(&scan, key),
        DocumentKind::Summary => classify_summary(&scan, key),
        DocumentKind::Event => classify_event(&scan, key),
    };
    Ok(doc)
}

fn classify_full(scan: &Scan, key: AccessKey) -> ClassifiedDoc {
    let counterparty_id = scan
        .scoped("emit", "CNPJ")
        .or_else(|| scan.scoped("emit", "CPF"))
        .or_else(|| scan.scoped("rem", "CNPJ"))
        .map(str::to_string)
        .unwrap_or_else(|| key.issuer_id().to_string());
    let status = match scan.scoped("infProt", "cStat") {
        Some("110") | Some("301") | Some("302") | Some("303") => DocumentStatus::Denied,
        _ => DocumentStatus::Authorized,
    };

    ClassifiedDoc {
        number: scan
            .get("nNF")
            .or_else(|| scan.get("nCT"))
            .map(str::to_string)
            .unwrap_or_else(|| strip_zeros(key.number())),
        series: scan
            .get("serie")
            .map(str::to_string)
            .unwrap_or_else(|| strip_zeros(key.series())),
        model: scan
            .get("mod")
            .map(str::to_string)
            .unwrap_or_else(|| key.model().to_string()),
        issued_at: scan
            .get("dhEmi")
            .or_else(|| scan.get("dEmi"))
            .map(str::to_string)
            .unwrap_or_else(|| key.emission_month()),
        counterparty_id,
        counterparty_name: scan
            .scoped("emit", "xNome")
            .or_else(|| scan.scoped("rem", "xNome"))
            .map(str::to_string),
        total_value: scan
            .get("vNF")
            .or_else(|| scan.get("vTPrest"))
            .map(str::to_string),
        status,
        event_type: None,
        event_id: None,
        kind: DocumentKind::Full,
        access_key: key,
    }
}

fn classify_summary(scan: &Scan, key: AccessKey) -> ClassifiedDoc {
    let root = scan.root.as_deref().unwrap_or("resNFe");
    let counterparty_id = scan
        .scoped(root, "CNPJ")
        .or_else(|| scan.scoped(root, "CPF"))
        .map(str::to_string)
        .unwrap_or_else(|| key.issuer_id().to_string());

    ClassifiedDoc {
        number: scan
            .get("nNF")
            .map(str::to_string)
            .unwrap_or_else(|| strip_zeros(key.number())),
        series: strip_zeros(key.series()),
        model: key.model().to_string(),
        issued_at: scan
            .get("dhEmi")
            .map(str::to_string)
            .unwrap_or_else(|| key.emission_month()),
        counterparty_id,
        counterparty_name: scan.scoped(root, "xNome").map(str::to_string),
        total_value: scan.get("vNF").map(str::to_string),
        status: scan
            .get("cSitNFe")
            .map(DocumentStatus::from_sit_code)
            .unwrap_or(DocumentStatus::Authorized),
        event_type: None,
        event_id: None,
        kind: DocumentKind::Summary,
        access_key: key,
    }
}

fn classify_event(scan: &Scan, key: AccessKey) -> ClassifiedDoc {
    let event_type = scan.get("tpEvento").map(str::to_string);
    let event_id = scan.ids.get("infEvento").cloned().or_else(|| {
        event_type.as_ref().map(|t| {
            let seq = scan.get("nSeqEvento").unwrap_or("1");
            format!("ID{}{}{:0>2}", t, key, seq)
        })
    });

    ClassifiedDoc {
        number: strip_zeros(key.number()),
        series: strip_zeros(key.series()),
        model: key.model().to_string(),
        issued_at: scan
            .get("dhEvento")
            .map(str::to_string)
            .unwrap_or_else(|| key.emission_month()),
        counterparty_id: key.issuer_id().to_string(),
        counterparty_name: None,
        total_value: None,
        status: DocumentStatus::Authorized,
        event_type,
        event_id,
        kind: DocumentKind::Event,
        access_key: key,
    }
}
