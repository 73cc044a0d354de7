//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi
//!
//! The search runs once with `usehistory=y`; records are then pulled from the
//! server-side history in `retstart`/`retmax` batches.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use chem2textqa_common::retry::read_text;
use chem2textqa_common::sandbox::SandboxClient as Client;
use chem2textqa_common::{AttemptError, MappingError, RateLimiter, Result, ScrapeError, SourceType, Throttle};

use crate::models::{RawRecord, ScientificDocument, SearchQuery};
use crate::normalise::{chemicals, dates};
use crate::settings::{copy_secret, ScraperSettings};
use super::{clean_text, next_page_size, SourceAdapter};

const EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const BATCH_SIZE: usize = 500;
const TOOL_NAME: &str = "chem2textqa";

/// MeSH qualifiers that mark a descriptor as a chemical substance.
const CHEMICAL_QUALIFIERS: [&str; 6] = [
    "pharmacology",
    "chemistry",
    "metabolism",
    "chemical synthesis",
    "therapeutic use",
    "toxicity",
];

/// One `<PubmedArticle>` as returned by efetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PubMedArticle {
    pub pmid: Option<String>,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub pub_year: Option<String>,
    pub pub_month: Option<String>,
    pub pub_day: Option<String>,
    pub medline_date: Option<String>,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub keywords: Vec<String>,
    pub mesh_headings: Vec<MeshHeading>,
    pub chemicals: Vec<String>,
    pub publication_types: Vec<String>,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshHeading {
    pub descriptor: String,
    pub qualifiers: Vec<String>,
}

impl MeshHeading {
    /// MEDLINE display form: "Descriptor/qualifier/qualifier".
    pub fn display(&self) -> String {
        std::iter::once(self.descriptor.as_str())
            .chain(self.qualifiers.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_chemical(&self) -> bool {
        self.qualifiers
            .iter()
            .any(|q| CHEMICAL_QUALIFIERS.contains(&q.to_lowercase().as_str()))
    }
}

/// Server-side search history handle.
#[derive(Debug, Clone, PartialEq)]
struct SearchHistory {
    count: usize,
    web_env: String,
    query_key: String,
}

pub struct PubMedClient {
    client: Client,
    throttle: Throttle,
    api_key: Option<SecretString>,
    email: String,
    base_url: String,
}

impl PubMedClient {
    pub fn new(settings: &ScraperSettings) -> Result<Self> {
        let client = Client::with_options(
            std::time::Duration::from_secs(settings.http.timeout_secs),
            &settings.http.user_agent,
        )?;
        Ok(Self {
            client,
            throttle: Throttle::new(
                SourceType::PubMed,
                RateLimiter::per_second(settings.ncbi_rate_limit()),
                settings.retry.clone(),
            ),
            api_key: settings.ncbi_api_key.as_ref().map(copy_secret),
            email: settings.ncbi_email.clone(),
            base_url: EUTILS_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different E-utilities root (mirrors, tests).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self.client.allow_url(&self.base_url);
        self
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("tool", TOOL_NAME.to_string()),
            ("email", self.email.clone()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.expose_secret().to_string()));
        }
        params
    }

    /// Run the search and keep the result set on the server.
    #[instrument(skip(self))]
    async fn esearch(&self, query: &SearchQuery) -> Result<SearchHistory> {
        let mut params = self.base_params();
        params.push(("term", query.text.clone()));
        params.push(("retmax", "0".to_string()));
        params.push(("retmode", "json".to_string()));
        params.push(("usehistory", "y".to_string()));
        if query.date_from.is_some() || query.date_to.is_some() {
            let from = query.date_from.map(|d| d.format("%Y/%m/%d").to_string());
            let to = query.date_to.map(|d| d.format("%Y/%m/%d").to_string());
            params.push(("datetype", "pdat".to_string()));
            params.push(("mindate", from.unwrap_or_else(|| "1800/01/01".to_string())));
            params.push(("maxdate", to.unwrap_or_else(|| "3000/12/31".to_string())));
        }

        let url = format!("{}/esearch.fcgi", self.base_url);
        let resp: Value = self.throttle.execute(|| {
            let req = self.client.get(&url).map(|r| r.query(&params));
            async move {
                let body = read_text(req?.send().await?).await?;
                Ok::<_, AttemptError>(serde_json::from_str::<Value>(&body)?)
            }
        }).await?;

        parse_esearch(&resp).ok_or_else(|| ScrapeError::FetchFailed {
            source_type: SourceType::PubMed,
            attempts: 1,
            last_error: format!("esearch returned no history handle: {}", resp["esearchresult"]["ERROR"]),
        })
    }

    /// Fetch one batch of articles from the search history.
    #[instrument(skip(self, history))]
    async fn efetch(&self, history: &SearchHistory, start: usize, size: usize) -> Result<Vec<PubMedArticle>> {
        let mut params = self.base_params();
        params.push(("WebEnv", history.web_env.clone()));
        params.push(("query_key", history.query_key.clone()));
        params.push(("retstart", start.to_string()));
        params.push(("retmax", size.to_string()));
        params.push(("retmode", "xml".to_string()));

        let url = format!("{}/efetch.fcgi", self.base_url);
        let xml = self.throttle.execute(|| {
            let req = self.client.get(&url).map(|r| r.query(&params));
            async move { read_text(req?.send().await?).await }
        }).await?;

        Ok(parse_pubmed_xml(&xml))
    }
}

#[async_trait]
impl SourceAdapter for PubMedClient {
    fn source(&self) -> SourceType {
        SourceType::PubMed
    }

    #[instrument(skip(self, query), fields(query = %query.text))]
    async fn fetch(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawRecord>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        info!(limit, "Searching PubMed");

        let history = self.esearch(query).await?;
        let fetch_count = history.count.min(limit);
        info!(found = history.count, fetching = fetch_count, "PubMed search complete");

        let mut articles: Vec<PubMedArticle> = Vec::with_capacity(fetch_count);
        while articles.len() < fetch_count {
            let size = next_page_size(articles.len(), fetch_count, BATCH_SIZE);
            let batch = self.efetch(&history, articles.len(), size).await?;
            debug!(start = articles.len(), n = batch.len(), "PubMed efetch batch");
            if batch.is_empty() {
                break;
            }
            articles.extend(batch);
        }
        articles.truncate(limit);

        Ok(articles.into_iter().map(RawRecord::PubMed).collect())
    }
}

fn parse_esearch(resp: &Value) -> Option<SearchHistory> {
    let result = &resp["esearchresult"];
    let count = match &result["count"] {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => n.as_u64()? as usize,
        _ => return None,
    };
    Some(SearchHistory {
        count,
        web_env: result["webenv"].as_str()?.to_string(),
        query_key: result["querykey"].as_str()?.to_string(),
    })
}

fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

fn within(path: &[String], name: &str) -> bool {
    path.iter().any(|p| p == name)
}

fn push_text(buf: &mut Option<String>, text: &str) {
    let s = buf.get_or_insert_with(String::new);
    s.push_str(text);
}

/// Parse PubMed XML (efetch) into articles.
/// Handles the <PubmedArticleSet><PubmedArticle> structure; references and
/// comment lists nested inside an article are ignored.
pub fn parse_pubmed_xml(xml: &str) -> Vec<PubMedArticle> {
    let mut articles = Vec::new();
    let mut reader = Reader::from_str(xml);

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<PubMedArticle> = None;
    let mut id_type: Option<String> = None;
    let mut last_name = String::new();
    let mut fore_name = String::new();
    let mut collective = String::new();
    let mut mesh: Option<MeshHeading> = None;
    let mut title: Option<String> = None;
    let mut abstract_text: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "PubmedArticle" => {
                        current = Some(PubMedArticle::default());
                        title = None;
                        abstract_text = None;
                    }
                    "Author" => {
                        last_name.clear();
                        fore_name.clear();
                        collective.clear();
                    }
                    "MeshHeading" => mesh = Some(MeshHeading::default()),
                    "ArticleId" => id_type = attr(e, b"IdType"),
                    "ELocationID" => id_type = attr(e, b"EIdType"),
                    _ => {}
                }
                path.push(name);
            }
            Ok(Event::Text(ref e)) => {
                let Some(ref mut p) = current else { buf.clear(); continue };
                let text = e.unescape().map(|t| t.into_owned()).unwrap_or_default();
                let leaf = path.last().map(String::as_str).unwrap_or("");

                if within(&path, "ArticleTitle") {
                    push_text(&mut title, &text);
                } else if within(&path, "AbstractText") && !within(&path, "OtherAbstract") {
                    push_text(&mut abstract_text, &text);
                } else if ends_with(&path, &["MedlineCitation", "PMID"]) {
                    p.pmid = clean_text(&text);
                } else if ends_with(&path, &["Journal", "Title"]) {
                    p.journal = clean_text(&text);
                } else if ends_with(&path, &["JournalIssue", "PubDate", "Year"]) {
                    p.pub_year = clean_text(&text);
                } else if ends_with(&path, &["JournalIssue", "PubDate", "Month"]) {
                    p.pub_month = clean_text(&text);
                } else if ends_with(&path, &["JournalIssue", "PubDate", "Day"]) {
                    p.pub_day = clean_text(&text);
                } else if ends_with(&path, &["JournalIssue", "PubDate", "MedlineDate"]) {
                    p.medline_date = clean_text(&text);
                } else if within(&path, "Author") && !within(&path, "AffiliationInfo") {
                    match leaf {
                        "LastName"       => last_name.push_str(text.trim()),
                        "ForeName"       => fore_name.push_str(text.trim()),
                        "CollectiveName" => collective.push_str(text.trim()),
                        _ => {}
                    }
                } else if ends_with(&path, &["Article", "ELocationID"]) {
                    if id_type.as_deref() == Some("doi") && p.doi.is_none() {
                        p.doi = clean_text(&text);
                    }
                } else if ends_with(&path, &["PubmedData", "ArticleIdList", "ArticleId"]) {
                    match id_type.as_deref() {
                        Some("doi") => p.doi = clean_text(&text),
                        Some("pmc") => p.pmcid = clean_text(&text),
                        _ => {}
                    }
                } else if ends_with(&path, &["KeywordList", "Keyword"]) {
                    p.keywords.extend(clean_text(&text));
                } else if ends_with(&path, &["Chemical", "NameOfSubstance"]) {
                    p.chemicals.extend(clean_text(&text));
                } else if ends_with(&path, &["PublicationTypeList", "PublicationType"]) {
                    p.publication_types.extend(clean_text(&text));
                } else if ends_with(&path, &["Article", "Language"]) {
                    p.languages.extend(clean_text(&text));
                } else if let Some(ref mut h) = mesh {
                    match leaf {
                        "DescriptorName" => h.descriptor.push_str(text.trim()),
                        "QualifierName"  => h.qualifiers.extend(clean_text(&text)),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                path.pop();
                match e.local_name().as_ref() {
                    b"AbstractText" => {
                        if let Some(ref mut a) = abstract_text {
                            a.push(' ');
                        }
                    }
                    b"Author" => {
                        if let Some(ref mut p) = current {
                            let name = if !collective.is_empty() {
                                collective.clone()
                            } else if fore_name.is_empty() {
                                last_name.clone()
                            } else {
                                format!("{} {}", fore_name, last_name)
                            };
                            if !name.trim().is_empty() && within(&path, "AuthorList") {
                                p.authors.push(name.trim().to_string());
                            }
                        }
                    }
                    b"MeshHeading" => {
                        if let (Some(p), Some(h)) = (current.as_mut(), mesh.take()) {
                            if !h.descriptor.is_empty() {
                                p.mesh_headings.push(h);
                            }
                        }
                    }
                    b"ArticleId" | b"ELocationID" => id_type = None,
                    b"PubmedArticle" => {
                        if let Some(mut p) = current.take() {
                            p.title = title.take().and_then(|t| clean_text(&t));
                            p.abstract_text = abstract_text.take().and_then(|a| clean_text(&a));
                            articles.push(p);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("PubMed XML parse error: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    articles
}

/// PubMed field table.
pub(crate) fn to_document(article: &PubMedArticle) -> std::result::Result<ScientificDocument, MappingError> {
    let pmid = article
        .pmid
        .clone()
        .ok_or_else(|| MappingError::new(SourceType::PubMed, "article has no PMID"))?;

    let mut doc = ScientificDocument::new(SourceType::PubMed);
    doc.title = article.title.clone();
    doc.abstract_text = article.abstract_text.clone();
    doc.authors = article.authors.clone();
    doc.publication_date = dates::parse_pubmed_date(
        article.pub_year.as_deref(),
        article.pub_month.as_deref(),
        article.pub_day.as_deref(),
        article.medline_date.as_deref(),
    );

    doc.identifiers.insert("pmid".into(), pmid.clone());
    if let Some(doi) = &article.doi {
        doc.identifiers.insert("doi".into(), doi.clone());
    }
    if let Some(pmcid) = &article.pmcid {
        doc.identifiers.insert("pmcid".into(), pmcid.clone());
    }

    doc.keywords.extend(article.keywords.iter().cloned());

    doc.chemical_entities.extend(article.chemicals.iter().cloned());
    doc.chemical_entities.extend(
        article.mesh_headings.iter().filter(|h| h.is_chemical()).map(|h| h.descriptor.clone()),
    );
    let free_text = format!(
        "{} {}",
        article.title.as_deref().unwrap_or(""),
        article.abstract_text.as_deref().unwrap_or("")
    );
    chemicals::merge(&mut doc.chemical_entities, chemicals::extract_chemicals(&free_text));

    let mesh: Vec<String> = article.mesh_headings.iter().map(MeshHeading::display).collect();
    doc.metadata.insert("mesh_headings".into(), json!(mesh));
    doc.metadata.insert("publication_type".into(), json!(article.publication_types));
    doc.metadata.insert("language".into(), json!(article.languages));
    if let Some(journal) = &article.journal {
        doc.metadata.insert("journal".into(), json!(journal));
    }
    doc.metadata.insert(
        "full_text_url".into(),
        json!(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", pmid)),
    );

    Ok(doc)
}
