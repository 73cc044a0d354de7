//! EPO Open Patent Services (OPS v3.2) client.
//!
//! Auth: OAuth2 client-credentials with the consumer key/secret pair.
//! Search: GET rest-services/published-data/search/biblio?q=<CQL>
//! with a `Range: <begin>-<end>` header (1-based, at most 100 per request).

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use chem2textqa_common::retry::read_text;
use chem2textqa_common::sandbox::SandboxClient as Client;
use chem2textqa_common::{AttemptError, MappingError, RateLimiter, Result, ScrapeError, SourceType, Throttle};

use crate::models::{RawRecord, ScientificDocument, SearchQuery};
use crate::normalise::{chemicals, dates};
use crate::settings::{copy_secret, ScraperSettings};
use super::{clean_text, next_page_size, SourceAdapter};

const OPS_BASE_URL: &str = "https://ops.epo.org/3.2";
const PAGE_SIZE: usize = 100;
/// Last result position OPS serves for a biblio search.
const MAX_RANGE_END: usize = 2000;
/// IPC class A61K: preparations for medical, dental or toilet purposes.
const DRUG_CLASS: &str = "A61K";
/// Refresh the token this long before OPS says it expires.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// One `<exchange-document>` from a biblio search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpoDocument {
    pub country: Option<String>,
    pub doc_number: Option<String>,
    pub kind: Option<String>,
    pub publication_date: Option<String>,
    /// (lang, text)
    pub titles: Vec<(Option<String>, String)>,
    /// (lang, text)
    pub abstracts: Vec<(Option<String>, String)>,
    /// (data-format, name)
    pub applicants: Vec<(Option<String>, String)>,
    pub ipc_codes: Vec<String>,
}

impl EpoDocument {
    /// docdb publication number, e.g. "EP1234567A1".
    pub fn patent_number(&self) -> Option<String> {
        let number = self.doc_number.as_deref()?;
        Some(format!(
            "{}{}{}",
            self.country.as_deref().unwrap_or(""),
            number,
            self.kind.as_deref().unwrap_or("")
        ))
    }
}

#[derive(Debug, Default, PartialEq)]
struct SearchPage {
    total: Option<usize>,
    documents: Vec<EpoDocument>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct EpoClient {
    client: Client,
    throttle: Throttle,
    key: Option<SecretString>,
    secret: Option<SecretString>,
    base_url: String,
    token: Mutex<Option<AccessToken>>,
}

impl EpoClient {
    pub fn new(settings: &ScraperSettings) -> Result<Self> {
        let client = Client::with_options(
            std::time::Duration::from_secs(settings.http.timeout_secs),
            &settings.http.user_agent,
        )?;
        Ok(Self {
            client,
            throttle: Throttle::new(
                SourceType::Epo,
                RateLimiter::per_second(settings.rate_limits.epo),
                settings.retry.clone(),
            ),
            key: settings.epo_key.as_ref().map(copy_secret),
            secret: settings.epo_secret.as_ref().map(copy_secret),
            base_url: OPS_BASE_URL.to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self.client.allow_url(&self.base_url);
        self
    }

    fn credentials(&self) -> Result<(&SecretString, &SecretString)> {
        let missing = |credential: &str| ScrapeError::Configuration {
            source_type: SourceType::Epo,
            credential: credential.to_string(),
        };
        let key = self.key.as_ref().ok_or_else(|| missing("epo_key"))?;
        let secret = self.secret.as_ref().ok_or_else(|| missing("epo_secret"))?;
        Ok((key, secret))
    }

    /// Cached OAuth token, refreshed when close to expiry.
    async fn access_token(&self, key: &SecretString, secret: &SecretString) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() + TOKEN_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/auth/accesstoken", self.base_url);
        let resp: Value = self.throttle.execute(|| {
            let req = self.client.post(&url).map(|r| {
                r.basic_auth(key.expose_secret(), Some(secret.expose_secret()))
                    .form(&[("grant_type", "client_credentials")])
            });
            async move {
                let text = read_text(req?.send().await?).await?;
                Ok::<_, AttemptError>(serde_json::from_str::<Value>(&text)?)
            }
        }).await?;

        let value = resp["access_token"]
            .as_str()
            .ok_or_else(|| ScrapeError::FetchFailed {
                source_type: SourceType::Epo,
                attempts: 1,
                last_error: "OAuth response carried no access_token".to_string(),
            })?
            .to_string();
        // OPS sends expires_in as a string of seconds
        let expires_in = match &resp["expires_in"] {
            Value::String(s) => s.parse().unwrap_or(1200),
            Value::Number(n) => n.as_u64().unwrap_or(1200),
            _ => 1200,
        };
        debug!(expires_in, "EPO access token obtained");

        *guard = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(value)
    }

    #[instrument(skip(self, cql, token))]
    async fn search_page(&self, cql: &str, token: &str, begin: usize, end: usize) -> Result<SearchPage> {
        let url = format!("{}/rest-services/published-data/search/biblio", self.base_url);
        let range = format!("{}-{}", begin, end);
        let xml = self.throttle.execute(|| {
            let req = self.client.get(&url).map(|r| {
                r.query(&[("q", cql)])
                    .header("Range", range.as_str())
                    .header("Accept", "application/xml")
                    .bearer_auth(token)
            });
            async move {
                let resp = req?.send().await?;
                // OPS answers an empty result set with 404
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok::<_, AttemptError>(String::new());
                }
                read_text(resp).await
            }
        }).await?;

        Ok(parse_search_response(&xml))
    }
}

/// CQL for a title/abstract search restricted to drug preparations.
fn build_cql(query: &SearchQuery) -> String {
    let text = query.text.replace('"', "");
    let mut cql = format!("ta=\"{}\" AND cl=\"{}\"", text.trim(), DRUG_CLASS);
    if let Some(from) = query.date_from {
        cql.push_str(&format!(" AND pd>=\"{}\"", from.format("%Y%m%d")));
    }
    if let Some(to) = query.date_to {
        cql.push_str(&format!(" AND pd<=\"{}\"", to.format("%Y%m%d")));
    }
    cql
}

#[async_trait]
impl SourceAdapter for EpoClient {
    fn source(&self) -> SourceType {
        SourceType::Epo
    }

    #[instrument(skip(self, query), fields(query = %query.text))]
    async fn fetch(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawRecord>> {
        let (key, secret) = self.credentials()?;
        if limit == 0 {
            return Ok(vec![]);
        }
        info!(limit, "Searching EPO");

        let cql = build_cql(query);
        let token = self.access_token(key, secret).await?;

        let mut documents: Vec<EpoDocument> = Vec::new();
        let mut begin = 1;
        loop {
            let window = (MAX_RANGE_END + 1).saturating_sub(begin);
            let size = next_page_size(documents.len(), limit, PAGE_SIZE).min(window);
            if size == 0 {
                if documents.len() < limit {
                    warn!(limit, max = MAX_RANGE_END, "EPO result window exhausted; results truncated");
                }
                break;
            }
            let end = begin + size - 1;
            let page = self.search_page(&cql, &token, begin, end).await?;
            let received = page.documents.len();
            debug!(begin, end, received, total = ?page.total, "EPO page");

            documents.extend(page.documents);
            let exhausted = page.total.is_some_and(|t| end >= t);
            if received < size || exhausted {
                break;
            }
            begin = end + 1;
        }
        documents.truncate(limit);

        info!(n = documents.len(), "EPO fetch complete");
        Ok(documents.into_iter().map(RawRecord::Epo).collect())
    }
}

fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn within(path: &[String], name: &str) -> bool {
    path.iter().any(|p| p == name)
}

/// Parse an OPS biblio search response. Malformed XML yields whatever was
/// read before the error.
fn parse_search_response(xml: &str) -> SearchPage {
    let mut page = SearchPage::default();
    let mut reader = Reader::from_str(xml);

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<EpoDocument> = None;
    let mut lang: Option<String> = None;
    let mut data_format: Option<String> = None;
    let mut text_buf = String::new();
    let mut in_docdb_id = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "biblio-search" => {
                        page.total = attr(e, b"total-result-count").and_then(|t| t.parse().ok());
                    }
                    "exchange-document" => {
                        current = Some(EpoDocument {
                            country: attr(e, b"country"),
                            doc_number: attr(e, b"doc-number"),
                            kind: attr(e, b"kind"),
                            ..Default::default()
                        });
                    }
                    "invention-title" | "abstract" => {
                        lang = attr(e, b"lang");
                        text_buf.clear();
                    }
                    "applicant" => data_format = attr(e, b"data-format"),
                    "document-id" if path.last().map(String::as_str) == Some("publication-reference") => {
                        let id_type = attr(e, b"document-id-type");
                        in_docdb_id = id_type.is_none() || id_type.as_deref() == Some("docdb");
                    }
                    "name" | "text" => text_buf.clear(),
                    _ => {}
                }
                path.push(name);
            }
            Ok(Event::Text(ref e)) => {
                let Some(ref mut doc) = current else { buf.clear(); continue };
                let text = e.unescape().map(|t| t.into_owned()).unwrap_or_default();
                let leaf = path.last().map(String::as_str).unwrap_or("");

                if within(&path, "invention-title") || within(&path, "abstract") {
                    text_buf.push_str(&text);
                } else if within(&path, "applicant-name") || within(&path, "classification-ipcr") {
                    text_buf.push_str(&text);
                } else if in_docdb_id && within(&path, "publication-reference") {
                    // Bibliographic data wins over the exchange-document attributes
                    match leaf {
                        "country"    => doc.country = clean_text(&text),
                        "doc-number" => doc.doc_number = clean_text(&text),
                        "kind"       => doc.kind = clean_text(&text),
                        "date"       => doc.publication_date = clean_text(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                path.pop();
                let Some(ref mut doc) = current else { buf.clear(); continue };
                match e.local_name().as_ref() {
                    b"invention-title" => {
                        if let Some(t) = clean_text(&text_buf) {
                            doc.titles.push((lang.take(), t));
                        }
                        text_buf.clear();
                    }
                    b"abstract" => {
                        if let Some(t) = clean_text(&text_buf) {
                            doc.abstracts.push((lang.take(), t));
                        }
                        text_buf.clear();
                    }
                    b"name" if within(&path, "applicant-name") => {
                        if let Some(n) = clean_text(&text_buf) {
                            doc.applicants.push((data_format.clone(), n));
                        }
                        text_buf.clear();
                    }
                    b"text" if within(&path, "classification-ipcr") => {
                        if let Some(code) = clean_text(&text_buf) {
                            doc.ipc_codes.push(code);
                        }
                        text_buf.clear();
                    }
                    b"p" if within(&path, "abstract") => text_buf.push(' '),
                    b"document-id" => in_docdb_id = false,
                    b"exchange-document" => {
                        if let Some(doc) = current.take() {
                            page.documents.push(doc);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("EPO XML parse error: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    page
}

fn pick_english(entries: &[(Option<String>, String)]) -> Option<String> {
    entries
        .iter()
        .find(|(lang, _)| lang.as_deref() == Some("en"))
        .or_else(|| entries.first())
        .map(|(_, text)| text.clone())
}

/// EPO field table.
pub(crate) fn to_document(document: &EpoDocument) -> std::result::Result<ScientificDocument, MappingError> {
    let patent_number = document
        .patent_number()
        .ok_or_else(|| MappingError::new(SourceType::Epo, "exchange-document has no doc-number"))?;

    let mut doc = ScientificDocument::new(SourceType::Epo);
    doc.title = pick_english(&document.titles);
    doc.abstract_text = pick_english(&document.abstracts);
    doc.publication_date = document.publication_date.as_deref().and_then(dates::parse_compact);
    doc.identifiers.insert("patent_number".into(), patent_number);

    // OPS lists each applicant once per data format; prefer the original spelling
    let preferred = if document.applicants.iter().any(|(f, _)| f.as_deref() == Some("original")) {
        Some("original")
    } else {
        None
    };
    for (format, name) in &document.applicants {
        if preferred.is_some() && format.as_deref() != preferred {
            continue;
        }
        if !doc.authors.contains(name) {
            doc.authors.push(name.clone());
        }
    }

    let free_text = format!(
        "{} {}",
        doc.title.as_deref().unwrap_or(""),
        doc.abstract_text.as_deref().unwrap_or("")
    );
    chemicals::merge(&mut doc.chemical_entities, chemicals::extract_chemicals(&free_text));

    doc.metadata.insert("ipc_codes".into(), json!(document.ipc_codes));
    doc.metadata.insert("office".into(), json!("EPO"));

    Ok(doc)
}
