//! USPTO PatentsView search API client.
//!
//! Endpoint: POST https://search.patentsview.org/api/v1/patent/
//! Auth: `X-Api-Key` header (required).
//!
//! Pagination is cursor-based: results are sorted by `patent_id` and the
//! last id of each page is sent back as `o.after`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use chem2textqa_common::retry::read_text;
use chem2textqa_common::sandbox::SandboxClient as Client;
use chem2textqa_common::{AttemptError, MappingError, RateLimiter, Result, ScrapeError, SourceType, Throttle};

use crate::models::{RawRecord, ScientificDocument, SearchQuery};
use crate::normalise::{chemicals, dates};
use crate::settings::{copy_secret, ScraperSettings};
use super::{clean_text, decode_each, next_page_size, SourceAdapter};

const PATENTSVIEW_URL: &str = "https://search.patentsview.org/api/v1/patent/";
const PAGE_SIZE: usize = 100;

const FIELDS: [&str; 8] = [
    "patent_id",
    "patent_title",
    "patent_abstract",
    "patent_date",
    "inventors.inventor_name_last",
    "inventors.inventor_name_first",
    "assignees.assignee_organization",
    "cpc_current.cpc_group_id",
];

/// One patent as returned by PatentsView.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UsptoPatent {
    pub patent_id: Option<String>,
    pub patent_title: Option<String>,
    pub patent_abstract: Option<String>,
    pub patent_date: Option<String>,
    #[serde(deserialize_with = "null_as_empty")]
    pub inventors: Vec<Inventor>,
    #[serde(deserialize_with = "null_as_empty")]
    pub assignees: Vec<Assignee>,
    #[serde(deserialize_with = "null_as_empty")]
    pub cpc_current: Vec<CpcClass>,
}

/// PatentsView sends `null` for empty nested lists.
fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Inventor {
    pub inventor_name_first: Option<String>,
    pub inventor_name_last: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Assignee {
    pub assignee_organization: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CpcClass {
    pub cpc_group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchPage {
    patents: Vec<Value>,
    total_hits: Option<usize>,
}

pub struct UsptoClient {
    client: Client,
    throttle: Throttle,
    api_key: Option<SecretString>,
    endpoint: String,
}

impl UsptoClient {
    pub fn new(settings: &ScraperSettings) -> Result<Self> {
        let client = Client::with_options(
            std::time::Duration::from_secs(settings.http.timeout_secs),
            &settings.http.user_agent,
        )?;
        Ok(Self {
            client,
            throttle: Throttle::new(
                SourceType::Uspto,
                RateLimiter::per_second(settings.rate_limits.uspto),
                settings.retry.clone(),
            ),
            api_key: settings.uspto_api_key.as_ref().map(copy_secret),
            endpoint: PATENTSVIEW_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.endpoint = url.to_string();
        self.client.allow_url(url);
        self
    }

    #[instrument(skip(self, body, api_key))]
    async fn fetch_page(&self, body: &Value, api_key: &str) -> Result<SearchPage> {
        self.throttle.execute(|| {
            let req = self.client
                .post(&self.endpoint)
                .map(|r| r.header("X-Api-Key", api_key).json(body));
            async move {
                let text = read_text(req?.send().await?).await?;
                Ok::<_, AttemptError>(serde_json::from_str::<SearchPage>(&text)?)
            }
        }).await
    }
}

/// Paging cursor from the raw last record, read before the record is decoded.
fn cursor_of(raw: &Value) -> Option<String> {
    match raw.get("patent_id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// PatentsView query body for one page.
fn build_query(query: &SearchQuery, size: usize, after: Option<&str>) -> Value {
    let mut filter = json!({
        "_or": [
            {"_text_phrase": {"patent_abstract": query.text}},
            {"_text_phrase": {"patent_title": query.text}},
        ]
    });

    if query.date_from.is_some() || query.date_to.is_some() {
        let mut clauses = vec![filter];
        if let Some(from) = query.date_from {
            clauses.push(json!({"_gte": {"patent_date": from.to_string()}}));
        }
        if let Some(to) = query.date_to {
            clauses.push(json!({"_lte": {"patent_date": to.to_string()}}));
        }
        filter = json!({ "_and": clauses });
    }

    let mut options = json!({ "size": size });
    if let Some(cursor) = after {
        options["after"] = json!(cursor);
    }

    json!({
        "q": filter,
        "f": FIELDS,
        "s": [{"patent_id": "asc"}],
        "o": options,
    })
}

#[async_trait]
impl SourceAdapter for UsptoClient {
    fn source(&self) -> SourceType {
        SourceType::Uspto
    }

    #[instrument(skip(self, query), fields(query = %query.text))]
    async fn fetch(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawRecord>> {
        let api_key = self.api_key.as_ref().ok_or_else(|| ScrapeError::Configuration {
            source_type: SourceType::Uspto,
            credential: "uspto_api_key".to_string(),
        })?;
        if limit == 0 {
            return Ok(vec![]);
        }
        info!(limit, "Searching USPTO");

        let mut patents: Vec<UsptoPatent> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = 0;

        loop {
            let size = next_page_size(seen, limit, PAGE_SIZE);
            if size == 0 {
                break;
            }
            let body = build_query(query, size, cursor.as_deref());
            let page = self.fetch_page(&body, api_key.expose_secret()).await?;
            let received = page.patents.len();
            debug!(received, total_hits = ?page.total_hits, "USPTO page");

            cursor = page.patents.last().and_then(cursor_of);
            seen += received;
            patents.extend(decode_each::<UsptoPatent>(SourceType::Uspto, page.patents));

            let exhausted = page.total_hits.is_some_and(|t| seen >= t);
            if received < size || cursor.is_none() || exhausted {
                break;
            }
        }
        patents.truncate(limit);

        info!(n = patents.len(), "USPTO fetch complete");
        Ok(patents.into_iter().map(RawRecord::Uspto).collect())
    }
}

/// USPTO field table.
pub(crate) fn to_document(patent: &UsptoPatent) -> std::result::Result<ScientificDocument, MappingError> {
    let patent_id = patent
        .patent_id
        .as_deref()
        .and_then(clean_text)
        .ok_or_else(|| MappingError::new(SourceType::Uspto, "patent has no patent_id"))?;

    let mut doc = ScientificDocument::new(SourceType::Uspto);
    doc.title = patent.patent_title.as_deref().and_then(clean_text);
    doc.abstract_text = patent.patent_abstract.as_deref().and_then(clean_text);
    doc.publication_date = patent.patent_date.as_deref().and_then(dates::parse_iso);
    doc.identifiers.insert("patent_number".into(), patent_id.clone());

    doc.authors = patent
        .inventors
        .iter()
        .filter_map(|inv| {
            let first = inv.inventor_name_first.as_deref().unwrap_or("");
            let last = inv.inventor_name_last.as_deref().unwrap_or("");
            clean_text(&format!("{} {}", first, last))
        })
        .collect();

    let free_text = format!(
        "{} {}",
        doc.title.as_deref().unwrap_or(""),
        doc.abstract_text.as_deref().unwrap_or("")
    );
    chemicals::merge(&mut doc.chemical_entities, chemicals::extract_chemicals(&free_text));

    let cpc_codes: Vec<&str> = patent
        .cpc_current
        .iter()
        .filter_map(|c| c.cpc_group_id.as_deref())
        .filter(|c| !c.is_empty())
        .collect();
    let assignees: Vec<&str> = patent
        .assignees
        .iter()
        .filter_map(|a| a.assignee_organization.as_deref())
        .filter(|a| !a.is_empty())
        .collect();

    doc.metadata.insert("cpc_codes".into(), json!(cpc_codes));
    doc.metadata.insert("assignees".into(), json!(assignees));
    doc.metadata.insert("office".into(), json!("USPTO"));
    doc.metadata.insert(
        "full_text_url".into(),
        json!(format!("https://patents.google.com/patent/US{}", patent_id)),
    );

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> UsptoPatent {
        serde_json::from_value(json!({
            "patent_id": "11234567",
            "patent_title": "Sustained release aspirin tablet",
            "patent_abstract": "A tablet comprising aspirin and  lactose.",
            "patent_date": "2022-01-04",
            "inventors": [
                {"inventor_name_first": "Ada", "inventor_name_last": "Lovelace"},
                {"inventor_name_first": null, "inventor_name_last": "Curie"},
                {}
            ],
            "assignees": [{"assignee_organization": "Acme Pharma"}, {"assignee_organization": ""}],
            "cpc_current": [{"cpc_group_id": "A61K9/20"}, {"cpc_group_id": "A61K31/616"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_to_document_mapping() {
        let doc = to_document(&sample()).unwrap();
        assert_eq!(doc.identifiers["patent_number"], "11234567");
        assert_eq!(doc.title.as_deref(), Some("Sustained release aspirin tablet"));
        assert_eq!(doc.abstract_text.as_deref(), Some("A tablet comprising aspirin and lactose."));
        assert_eq!(doc.authors, vec!["Ada Lovelace", "Curie"]);
        assert_eq!(doc.publication_date, NaiveDate::from_ymd_opt(2022, 1, 4));
        assert_eq!(doc.metadata["cpc_codes"], json!(["A61K9/20", "A61K31/616"]));
        assert_eq!(doc.metadata["assignees"], json!(["Acme Pharma"]));
        assert!(doc.chemical_entities.contains("aspirin"));
        assert!(doc.chemical_entities.contains("lactose"));
    }

    #[test]
    fn test_missing_fields_are_tolerated() {
        let patent: UsptoPatent = serde_json::from_value(json!({"patent_id": "1", "patent_date": "bogus"})).unwrap();
        let doc = to_document(&patent).unwrap();
        assert_eq!(doc.title, None);
        assert_eq!(doc.publication_date, None);
        assert!(doc.authors.is_empty());
    }

    #[test]
    fn test_null_lists_decode_as_empty() {
        let patent: UsptoPatent = serde_json::from_value(json!({
            "patent_id": "2",
            "inventors": null,
            "assignees": null,
            "cpc_current": null
        }))
        .unwrap();
        assert!(patent.inventors.is_empty());
        assert!(patent.assignees.is_empty());
        assert!(patent.cpc_current.is_empty());
    }

    #[test]
    fn test_cursor_reads_string_or_numeric_id() {
        assert_eq!(cursor_of(&json!({"patent_id": "11000001"})), Some("11000001".to_string()));
        assert_eq!(cursor_of(&json!({"patent_id": 11000002})), Some("11000002".to_string()));
        assert_eq!(cursor_of(&json!({"patent_title": "no id"})), None);
    }

    #[test]
    fn test_build_query_with_cursor_and_dates() {
        let q = SearchQuery::new("drug delivery").with_dates(NaiveDate::from_ymd_opt(2020, 1, 1), None);
        let body = build_query(&q, 50, Some("10999999"));
        assert_eq!(body["o"]["size"], 50);
        assert_eq!(body["o"]["after"], "10999999");
        assert_eq!(body["q"]["_and"][1]["_gte"]["patent_date"], "2020-01-01");
        assert_eq!(body["q"]["_and"][0]["_or"][1]["_text_phrase"]["patent_title"], "drug delivery");

        let plain = build_query(&SearchQuery::new("x"), 100, None);
        assert!(plain["o"].get("after").is_none());
        assert!(plain["q"].get("_or").is_some());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_network() {
        let client = UsptoClient::new(&ScraperSettings::default()).unwrap();
        let t0 = std::time::Instant::now();
        let err = client.fetch(&SearchQuery::new("aspirin"), 10).await.unwrap_err();
        assert!(t0.elapsed() < std::time::Duration::from_millis(500));
        match err {
            ScrapeError::Configuration { source_type, credential } => {
                assert_eq!(source_type, SourceType::Uspto);
                assert_eq!(credential, "uspto_api_key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
