//! Google Patents client.
//!
//! With a SerpAPI key: GET https://serpapi.com/search.json?engine=google_patents
//! Without one: best-effort scrape of https://patents.google.com/ result pages.
//! Both backends are page-numbered.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use chem2textqa_common::retry::read_text;
use chem2textqa_common::sandbox::SandboxClient as Client;
use chem2textqa_common::{AttemptError, MappingError, RateLimiter, Result, SourceType, Throttle};

use crate::models::{RawRecord, ScientificDocument, SearchQuery};
use crate::normalise::{chemicals, dates};
use crate::settings::{copy_secret, ScraperSettings};
use super::{clean_text, decode_each, SourceAdapter};

const SERPAPI_URL: &str = "https://serpapi.com/search.json";
const GOOGLE_PATENTS_URL: &str = "https://patents.google.com/";
const SERPAPI_ENGINE: &str = "google_patents";
const SERPAPI_PAGE_SIZE: usize = 100;
const SERPAPI_MIN_PAGE_SIZE: usize = 10;
const MAX_TITLE_CHARS: usize = 200;

/// Which backend produced a hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HitOrigin {
    SerpApi,
    #[default]
    Html,
}

impl HitOrigin {
    fn as_str(self) -> &'static str {
        match self {
            HitOrigin::SerpApi => "serpapi",
            HitOrigin::Html => "html",
        }
    }
}

/// One search result. SerpAPI's `organic_results` entries deserialize
/// directly; HTML results fill the subset the page exposes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GooglePatentsHit {
    #[serde(skip)]
    pub origin: HitOrigin,
    pub title: Option<String>,
    pub patent_id: Option<String>,
    pub snippet: Option<String>,
    pub inventor: Option<String>,
    pub assignee: Option<String>,
    pub priority_date: Option<String>,
    pub filing_date: Option<String>,
    pub grant_date: Option<String>,
    pub link: Option<String>,
    pub pdf: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SerpApiPage {
    organic_results: Vec<Value>,
}

pub struct GooglePatentsClient {
    client: Client,
    throttle: Throttle,
    serpapi_key: Option<SecretString>,
    serpapi_url: String,
    html_url: String,
}

impl GooglePatentsClient {
    pub fn new(settings: &ScraperSettings) -> Result<Self> {
        let client = Client::with_options(
            std::time::Duration::from_secs(settings.http.timeout_secs),
            &settings.http.user_agent,
        )?;
        Ok(Self {
            client,
            throttle: Throttle::new(
                SourceType::GooglePatents,
                RateLimiter::per_second(settings.rate_limits.google_patents),
                settings.retry.clone(),
            ),
            serpapi_key: settings.serpapi_key.as_ref().map(copy_secret),
            serpapi_url: SERPAPI_URL.to_string(),
            html_url: GOOGLE_PATENTS_URL.to_string(),
        })
    }

    pub fn with_serpapi_url(mut self, url: &str) -> Self {
        self.serpapi_url = url.to_string();
        self.client.allow_url(url);
        self
    }

    pub fn with_html_url(mut self, url: &str) -> Self {
        self.html_url = url.to_string();
        self.client.allow_url(url);
        self
    }

    #[instrument(skip(self, query, key))]
    async fn serpapi_page(&self, query: &SearchQuery, key: &SecretString, page: usize, num: usize) -> Result<Vec<GooglePatentsHit>> {
        let mut params = vec![
            ("engine", SERPAPI_ENGINE.to_string()),
            ("q", query.text.clone()),
            ("api_key", key.expose_secret().to_string()),
            ("page", page.to_string()),
            ("num", num.to_string()),
        ];
        params.extend(date_params(query));

        let parsed: SerpApiPage = self.throttle.execute(|| {
            let req = self.client.get(&self.serpapi_url).map(|r| r.query(&params));
            async move {
                let body = read_text(req?.send().await?).await?;
                Ok::<_, AttemptError>(serde_json::from_str::<SerpApiPage>(&body)?)
            }
        }).await?;

        Ok(decode_each::<GooglePatentsHit>(SourceType::GooglePatents, parsed.organic_results)
            .into_iter()
            .map(|mut hit| {
                hit.origin = HitOrigin::SerpApi;
                hit
            })
            .collect())
    }

    #[instrument(skip(self, query))]
    async fn html_page(&self, query: &SearchQuery, page: usize) -> Result<Vec<GooglePatentsHit>> {
        let mut params = vec![("q", query.text.clone()), ("page", page.to_string())];
        params.extend(date_params(query));

        let html = self.throttle.execute(|| {
            let req = self.client.get(&self.html_url).map(|r| r.query(&params));
            async move { read_text(req?.send().await?).await }
        }).await?;
        Ok(parse_results_page(&html))
    }
}

/// Priority-date bounds in the form both backends accept.
fn date_params(query: &SearchQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(from) = query.date_from {
        params.push(("after", format!("priority:{}", from.format("%Y%m%d"))));
    }
    if let Some(to) = query.date_to {
        params.push(("before", format!("priority:{}", to.format("%Y%m%d"))));
    }
    params
}

#[async_trait]
impl SourceAdapter for GooglePatentsClient {
    fn source(&self) -> SourceType {
        SourceType::GooglePatents
    }

    #[instrument(skip(self, query), fields(query = %query.text))]
    async fn fetch(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawRecord>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<GooglePatentsHit> = Vec::new();
        match &self.serpapi_key {
            Some(key) => {
                // SerpAPI offsets by (page - 1) * num, so num stays fixed for the run.
                let num = limit.clamp(SERPAPI_MIN_PAGE_SIZE, SERPAPI_PAGE_SIZE);
                info!(limit, num, "Searching Google Patents via SerpAPI");
                let mut page = 1;
                while hits.len() < limit {
                    let batch = self.serpapi_page(query, key, page, num).await?;
                    debug!(page, received = batch.len(), "SerpAPI page");
                    if batch.is_empty() {
                        break;
                    }
                    hits.extend(batch);
                    page += 1;
                }
            }
            None => {
                info!(limit, "Searching Google Patents via HTML scrape");
                let mut page = 0;
                while hits.len() < limit {
                    let batch = self.html_page(query, page).await?;
                    debug!(page, received = batch.len(), "Google Patents page");
                    if batch.is_empty() {
                        if page == 0 {
                            warn!("No results on the first page; the page layout may have changed");
                        }
                        break;
                    }
                    hits.extend(batch);
                    page += 1;
                }
            }
        }
        hits.truncate(limit);

        info!(n = hits.len(), "Google Patents fetch complete");
        Ok(hits.into_iter().map(RawRecord::GooglePatents).collect())
    }
}

fn first_match<'a>(element: &ElementRef<'a>, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    element.select(&selector).next()
}

fn element_text(element: &ElementRef) -> Option<String> {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

/// Extract result items from a search page. Items with no text at all are
/// dropped.
pub fn parse_results_page(html: &str) -> Vec<GooglePatentsHit> {
    let document = Html::parse_document(html);
    let mut items: Vec<ElementRef> = Vec::new();
    for css in ["search-result-item, article.result", "[data-result]"] {
        if let Ok(selector) = Selector::parse(css) {
            items = document.select(&selector).collect();
        }
        if !items.is_empty() {
            break;
        }
    }
    items.iter().filter_map(parse_result_item).collect()
}

fn parse_result_item(element: &ElementRef) -> Option<GooglePatentsHit> {
    let title = first_match(element, "h3, .result-title, [data-title]")
        .and_then(|e| element_text(&e))
        .or_else(|| element_text(element).map(|t| t.chars().take(MAX_TITLE_CHARS).collect()))?;

    let mut hit = GooglePatentsHit {
        origin: HitOrigin::Html,
        title: Some(title),
        snippet: first_match(element, ".result-snippet, .abstract, p").and_then(|e| element_text(&e)),
        ..Default::default()
    };

    if let Some(href) = first_match(element, "a[href*='/patent/']").and_then(|a| a.value().attr("href")) {
        hit.patent_id = patent_id_from_link(href);
        hit.link = Some(if href.starts_with('/') {
            format!("https://patents.google.com{}", href)
        } else {
            href.to_string()
        });
    }
    Some(hit)
}

/// Publication number from a `/patent/<id>/...` link.
fn patent_id_from_link(href: &str) -> Option<String> {
    static PATENT_LINK: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATENT_LINK
        .get_or_init(|| {
            Regex::new(r"/patent/([A-Za-z0-9]+)")
                .map_err(|e| warn!("Failed to compile patent link pattern: {}", e))
                .ok()
        })
        .as_ref()?;
    re.captures(href).map(|c| c[1].to_string())
}

/// Google Patents field table.
pub(crate) fn to_document(hit: &GooglePatentsHit) -> std::result::Result<ScientificDocument, MappingError> {
    let patent_id = hit
        .patent_id
        .as_deref()
        .and_then(clean_text)
        .ok_or_else(|| MappingError::new(SourceType::GooglePatents, "result has no patent_id"))?;

    let mut doc = ScientificDocument::new(SourceType::GooglePatents);
    doc.title = hit.title.as_deref().and_then(clean_text);
    doc.abstract_text = hit.snippet.as_deref().and_then(clean_text);
    doc.authors.extend(hit.inventor.as_deref().and_then(clean_text));
    doc.publication_date = hit
        .priority_date
        .as_deref()
        .and_then(dates::parse_iso)
        .or_else(|| hit.filing_date.as_deref().and_then(dates::parse_iso));
    doc.identifiers.insert("patent_number".into(), patent_id);

    let free_text = format!(
        "{} {}",
        doc.title.as_deref().unwrap_or(""),
        doc.abstract_text.as_deref().unwrap_or("")
    );
    chemicals::merge(&mut doc.chemical_entities, chemicals::extract_chemicals(&free_text));

    let optional = [
        ("assignee", &hit.assignee),
        ("grant_date", &hit.grant_date),
        ("thumbnail", &hit.thumbnail),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            doc.metadata.insert(key.into(), json!(v));
        }
    }
    if let Some(url) = hit.pdf.as_ref().or(hit.link.as_ref()) {
        doc.metadata.insert("full_text_url".into(), json!(url));
    }
    doc.metadata.insert("backend".into(), json!(hit.origin.as_str()));

    Ok(doc)
}
