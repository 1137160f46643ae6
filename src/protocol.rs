//! Distribution protocol codec and SOAP transport.
//!
//! Builds the `distDFeInt` request (cursor or single-key form), wraps it in
//! a SOAP 1.2 envelope, and parses the `retDistDFeInt` answer into a
//! [`DistributionResponse`] once, at the boundary. Element names are
//! matched by local name, so namespace prefixes in the response do not
//! matter.
//!
//! # Status codes
//!
//! | `cStat` | [`DistStatus`] | Caller action |
//! |---------|----------------|---------------|
//! | 137 | `NoDocuments` | advance cursor, stop |
//! | 138 | `DocumentsFound` | persist, advance, loop while `ultNSU < maxNSU` |
//! | 656 | `RateLimited` | record quota rejection, stop |
//! | 593, 640, 641 | `PermissionDenied` | stop (per document on the key path) |
//! | 217, 632 | `NotFound` | key path only: skip |
//!
//! A 138 answer whose `ultNSU` is below `maxNSU` means the per-call cap
//! was reached; [`DistributionResponse::has_more`] reports it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::SigningIdentityProvider;
use crate::models::{AccessKey, Environment, Nsu, Taxpayer};

const NFE_NS: &str = "http://www.portalfiscal.inf.br/nfe";
const WSDL_NS: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe";
const SOAP_ACTION: &str =
    "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe/nfeDistDFeInteresse";

/// What to ask the distribution service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistQuery {
    /// Everything after this NSU.
    Cursor(Nsu),
    /// One document by access key.
    AccessKey(AccessKey),
}

/// Normalized authority status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistStatus {
    NoDocuments,
    DocumentsFound,
    RateLimited,
    PermissionDenied,
    NotFound,
    Other(String),
}

impl DistStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "137" => DistStatus::NoDocuments,
            "138" => DistStatus::DocumentsFound,
            "656" => DistStatus::RateLimited,
            "593" | "640" | "641" => DistStatus::PermissionDenied,
            "217" | "632" => DistStatus::NotFound,
            other => DistStatus::Other(other.to_string()),
        }
    }
}

/// One compressed document entry (`docZip`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocZip {
    pub nsu: Nsu,
    /// Schema attribute, e.g. `resNFe_v1.01.xsd`.
    pub schema: String,
    /// Base64 body as received.
    pub payload: String,
}

/// Parsed `retDistDFeInt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionResponse {
    pub status: DistStatus,
    pub code: String,
    pub reason: String,
    pub last_nsu: Option<Nsu>,
    pub max_nsu: Option<Nsu>,
    pub entries: Vec<DocZip>,
}

impl DistributionResponse {
    /// True when the per-call cap was hit and more documents are waiting.
    pub fn has_more(&self) -> bool {
        match (&self.status, self.last_nsu, self.max_nsu) {
            (DistStatus::DocumentsFound, Some(last), Some(max)) => last < max,
            _ => false,
        }
    }
}

/// Seam between the engine and the network.
#[async_trait]
pub trait DistributionService: Send + Sync {
    async fn distribute(
        &self,
        taxpayer: &Taxpayer,
        query: &DistQuery,
    ) -> SyncResult<DistributionResponse>;
}

/// Build the `distDFeInt` message.
pub fn build_request(environment: Environment, taxpayer: &Taxpayer, query: &DistQuery) -> String {
    let id_tag = if taxpayer.is_cpf() { "CPF" } else { "CNPJ" };
    let body = match query {
        DistQuery::Cursor(nsu) => format!("<distNSU><ultNSU>{}</ultNSU></distNSU>", nsu),
        DistQuery::AccessKey(key) => format!("<consChNFe><chNFe>{}</chNFe></consChNFe>", key),
    };
    format!(
        "<distDFeInt xmlns=\"{ns}\" versao=\"1.01\"><tpAmb>{amb}</tpAmb><cUFAutor>{uf}</cUFAutor><{tag}>{id}</{tag}>{body}</distDFeInt>",
        ns = NFE_NS,
        amb = environment.tp_amb(),
        uf = taxpayer.uf_code,
        tag = id_tag,
        id = taxpayer.tax_id,
        body = body,
    )
}

/// Wrap a message in the SOAP 1.2 envelope expected by the service.
pub fn build_envelope(message: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
            "<soap12:Envelope xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" ",
            "xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" ",
            "xmlns:soap12=\"http://www.w3.org/2003/05/soap-envelope\">",
            "<soap12:Body><nfeDistDFeInteresse xmlns=\"{}\"><nfeDadosMsg>{}</nfeDadosMsg>",
            "</nfeDistDFeInteresse></soap12:Body></soap12:Envelope>"
        ),
        WSDL_NS, message
    )
}

/// Parse a SOAP response body into a [`DistributionResponse`].
pub fn parse_response(body: &str) -> SyncResult<DistributionResponse> {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut fields: HashMap<&'static str, String> = HashMap::new();
    let mut entries = Vec::new();
    let mut open_zip: Option<(Nsu, String, String)> = None;
    let mut fault: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "docZip" {
                    let (nsu, schema) = zip_attributes(&e)?;
                    open_zip = Some((nsu, schema, String::new()));
                } else if name == "Fault" {
                    fault.get_or_insert_with(String::new);
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"docZip" {
                    let (nsu, schema) = zip_attributes(&e)?;
                    entries.push(DocZip {
                        nsu,
                        schema,
                        payload: String::new(),
                    });
                }
            }
            Ok(Event::End(_)) => {
                if stack.pop().as_deref() == Some("docZip") {
                    if let Some((nsu, schema, payload)) = open_zip.take() {
                        entries.push(DocZip {
                            nsu,
                            schema,
                            payload,
                        });
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| SyncError::Protocol(format!("bad XML text: {}", e)))?;
                let current = stack.last().map(String::as_str).unwrap_or("");
                if let Some(f) = fault.as_mut() {
                    if current == "Text" || current == "faultstring" {
                        f.push_str(&text);
                    }
                }
                match current {
                    "docZip" => {
                        if let Some((_, _, payload)) = open_zip.as_mut() {
                            payload.push_str(&text);
                        }
                    }
                    "cStat" => {
                        fields.entry("cStat").or_insert_with(|| text.into_owned());
                    }
                    "xMotivo" => {
                        fields.entry("xMotivo").or_insert_with(|| text.into_owned());
                    }
                    "ultNSU" => {
                        fields.entry("ultNSU").or_insert_with(|| text.into_owned());
                    }
                    "maxNSU" => {
                        fields.entry("maxNSU").or_insert_with(|| text.into_owned());
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SyncError::Protocol(format!(
                    "malformed response at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if let Some(f) = fault {
        return Err(SyncError::Protocol(format!("SOAP fault: {}", f.trim())));
    }

    let code = fields
        .remove("cStat")
        .ok_or_else(|| SyncError::Protocol("response has no cStat".into()))?;
    let reason = fields.remove("xMotivo").unwrap_or_default();
    let last_nsu = fields.remove("ultNSU").map(|s| s.parse::<Nsu>()).transpose()?;
    let max_nsu = fields.remove("maxNSU").map(|s| s.parse::<Nsu>()).transpose()?;

    Ok(DistributionResponse {
        status: DistStatus::from_code(code.trim()),
        code: code.trim().to_string(),
        reason,
        last_nsu,
        max_nsu,
        entries,
    })
}

fn zip_attributes(e: &quick_xml::events::BytesStart<'_>) -> SyncResult<(Nsu, String)> {
    let mut nsu = None;
    let mut schema = String::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| SyncError::Protocol(format!("bad docZip attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| SyncError::Protocol(format!("bad docZip attribute: {}", e)))?;
        match attr.key.local_name().as_ref() {
            b"NSU" => nsu = Some(value.parse::<Nsu>()?),
            b"schema" => schema = value.into_owned(),
            _ => {}
        }
    }
    let nsu = nsu.ok_or_else(|| SyncError::Protocol("docZip without NSU".into()))?;
    Ok((nsu, schema))
}

/// HTTPS SOAP client for the distribution service.
///
/// One `reqwest::Client` is built per taxpayer (the TLS identity is
/// per-certificate) and reused across calls. Transport failures are retried
/// with exponential backoff; authority status codes are returned as-is.
pub struct SoapClient {
    endpoint: String,
    environment: Environment,
    timeout: Duration,
    max_retries: u32,
    identities: Arc<dyn SigningIdentityProvider>,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl SoapClient {
    pub fn new(service: &ServiceConfig, identities: Arc<dyn SigningIdentityProvider>) -> Self {
        Self {
            endpoint: service.endpoint().to_string(),
            environment: service.environment,
            timeout: Duration::from_secs(service.timeout_secs),
            max_retries: service.max_retries,
            identities,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, taxpayer_id: &str) -> SyncResult<reqwest::Client> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| SyncError::Identity("client cache lock poisoned".into()))?;
        if let Some(c) = clients.get(taxpayer_id) {
            return Ok(c.clone());
        }
        let identity = self.identities.identity(taxpayer_id)?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(self.timeout)
            .build()
            .map_err(|e| SyncError::Identity(format!("cannot build TLS client: {}", e)))?;
        clients.insert(taxpayer_id.to_string(), client.clone());
        Ok(client)
    }

    async fn post_once(&self, client: &reqwest::Client, envelope: &str) -> SyncResult<String> {
        let resp = client
            .post(&self.endpoint)
            .header(
                "Content-Type",
                format!("application/soap+xml; charset=utf-8; action=\"{}\"", SOAP_ACTION),
            )
            .body(envelope.to_string())
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        let excerpt: String = body.chars().take(300).collect();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(SyncError::transport_retryable(format!(
                "HTTP {}: {}",
                status, excerpt
            )))
        } else {
            Err(SyncError::transport_fatal(format!("HTTP {}: {}", status, excerpt)))
        }
    }
}

#[async_trait]
impl DistributionService for SoapClient {
    async fn distribute(
        &self,
        taxpayer: &Taxpayer,
        query: &DistQuery,
    ) -> SyncResult<DistributionResponse> {
        let client = self.client_for(&taxpayer.tax_id)?;
        let envelope = build_envelope(&build_request(self.environment, taxpayer, query));

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.post_once(&client, &envelope).await {
                Ok(body) => {
                    let parsed = parse_response(&body)?;
                    debug!(
                        taxpayer = %taxpayer.tax_id,
                        code = %parsed.code,
                        entries = parsed.entries.len(),
                        "distribution response"
                    );
                    return Ok(parsed);
                }
                Err(e) if e.is_retryable() => {
                    warn!(taxpayer = %taxpayer.tax_id, attempt, error = %e, "transport failure, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| SyncError::transport_fatal("distribution call failed after retries")))
    }
}
