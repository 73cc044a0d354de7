//! Adapters and the orchestrator against local fake upstreams.
//!
//! Each test binds an axum server on 127.0.0.1:0 and points a client at it,
//! so nothing here touches the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use chem2textqa_common::{RetryPolicy, ScrapeError, SourceType};
use chem2textqa_ingestion::pipeline::{SourceSelection, SourceStatus};
use chem2textqa_ingestion::settings::secret_from;
use chem2textqa_ingestion::sources::epo::EpoClient;
use chem2textqa_ingestion::sources::google_patents::GooglePatentsClient;
use chem2textqa_ingestion::sources::pubmed::PubMedClient;
use chem2textqa_ingestion::sources::uspto::UsptoClient;
use chem2textqa_ingestion::sources::SourceAdapter;
use chem2textqa_ingestion::store::{append_documents, count_documents};
use chem2textqa_ingestion::{Orchestrator, RawRecord, ScraperSettings, SearchQuery};

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fast_settings() -> ScraperSettings {
    let mut settings = ScraperSettings::default();
    settings.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 5,
    };
    settings.rate_limits.pubmed = Some(1000.0);
    settings.rate_limits.uspto = 1000.0;
    settings.rate_limits.epo = 1000.0;
    settings.rate_limits.google_patents = 1000.0;
    settings.uspto_api_key = secret_from(Some("test-key".into()));
    settings
}

// ── USPTO ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct UsptoState {
    requests: AtomicUsize,
    failures_left: AtomicUsize,
    status_on_failure: u16,
}

const USPTO_TOTAL: usize = 250;

async fn uspto_handler(State(state): State<Arc<UsptoState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("test-key") {
        return (StatusCode::FORBIDDEN, "missing key").into_response();
    }
    if state.failures_left.load(Ordering::SeqCst) > 0 {
        state.failures_left.fetch_sub(1, Ordering::SeqCst);
        let status = StatusCode::from_u16(state.status_on_failure).unwrap();
        return (status, "upstream trouble").into_response();
    }

    let size = body["o"]["size"].as_u64().unwrap_or(100) as usize;
    let after = body["o"]["after"].as_str().map(str::to_string);
    let patents: Vec<Value> = (1..=USPTO_TOTAL)
        .map(|i| format!("{}", 10_000_000 + i))
        .filter(|id| after.as_ref().map_or(true, |a| id.as_str() > a.as_str()))
        .take(size)
        .map(|id| json!({ "patent_id": id, "patent_title": format!("Aspirin patent {}", id), "patent_date": "2023-01-31" }))
        .collect();

    Json(json!({ "error": false, "count": patents.len(), "total_hits": USPTO_TOTAL, "patents": patents })).into_response()
}

async fn uspto_server(failures: usize, status_on_failure: u16) -> (Arc<UsptoState>, String) {
    let state = Arc::new(UsptoState {
        failures_left: AtomicUsize::new(failures),
        status_on_failure,
        ..Default::default()
    });
    let router = Router::new()
        .route("/api/v1/patent/", post(uspto_handler))
        .with_state(state.clone());
    let base = serve(router).await;
    (state, format!("{}/api/v1/patent/", base))
}

#[tokio::test]
async fn test_uspto_stops_at_limit_across_pages() {
    let (state, endpoint) = uspto_server(0, 503).await;
    let client = UsptoClient::new(&fast_settings()).unwrap().with_endpoint(&endpoint);

    let records = client.fetch(&SearchQuery::new("aspirin"), 150).await.unwrap();
    assert_eq!(records.len(), 150);
    assert_eq!(state.requests.load(Ordering::SeqCst), 2);

    let ids: Vec<_> = records
        .iter()
        .map(|r| match r {
            RawRecord::Uspto(p) => p.patent_id.clone().unwrap(),
            other => panic!("unexpected record {:?}", other),
        })
        .collect();
    assert_eq!(ids.first().map(String::as_str), Some("10000001"));
    assert_eq!(ids.last().map(String::as_str), Some("10000150"));
}

#[tokio::test]
async fn test_uspto_returns_everything_when_upstream_runs_dry() {
    let (_, endpoint) = uspto_server(0, 503).await;
    let client = UsptoClient::new(&fast_settings()).unwrap().with_endpoint(&endpoint);
    let records = client.fetch(&SearchQuery::new("aspirin"), 1000).await.unwrap();
    assert_eq!(records.len(), USPTO_TOTAL);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let (state, endpoint) = uspto_server(2, 503).await;
    let client = UsptoClient::new(&fast_settings()).unwrap().with_endpoint(&endpoint);
    let records = tokio_test::assert_ok!(client.fetch(&SearchQuery::new("aspirin"), 5).await);
    assert_eq!(records.len(), 5);
    assert_eq!(state.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let (state, endpoint) = uspto_server(100, 429).await;
    let client = UsptoClient::new(&fast_settings()).unwrap().with_endpoint(&endpoint);
    let err = client.fetch(&SearchQuery::new("aspirin"), 5).await.unwrap_err();
    assert!(matches!(err, ScrapeError::FetchFailed { attempts: 3, .. }), "{err:?}");
    assert_eq!(state.requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_errors_fail_without_retry() {
    let (state, endpoint) = uspto_server(100, 404).await;
    let client = UsptoClient::new(&fast_settings()).unwrap().with_endpoint(&endpoint);
    let err = client.fetch(&SearchQuery::new("aspirin"), 5).await.unwrap_err();
    assert!(matches!(err, ScrapeError::FetchFailed { attempts: 1, .. }), "{err:?}");
    assert_eq!(state.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_uspto_bad_record_is_dropped_not_the_page() {
    let router = Router::new().route(
        "/api/v1/patent/",
        post(|| async {
            Json(json!({
                "total_hits": 3,
                "patents": [
                    { "patent_id": "1", "patent_title": "Good", "inventors": [] },
                    { "patent_id": "2", "patent_title": "Null lists", "inventors": null, "assignees": null },
                    { "patent_id": 3, "patent_title": "Numeric id" }
                ]
            }))
        }),
    );
    let base = serve(router).await;
    let client = UsptoClient::new(&fast_settings()).unwrap().with_endpoint(&format!("{}/api/v1/patent/", base));

    let records = tokio_test::assert_ok!(client.fetch(&SearchQuery::new("aspirin"), 10).await);
    let ids: Vec<_> = records
        .iter()
        .map(|r| match r {
            RawRecord::Uspto(p) => p.patent_id.clone().unwrap(),
            other => panic!("unexpected record {:?}", other),
        })
        .collect();
    assert_eq!(ids, vec!["1", "2"]);
}

// ── EPO ───────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_epo_without_credentials_makes_no_request() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().fallback(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            StatusCode::OK
        }
    });
    let base = serve(router).await;

    let client = EpoClient::new(&fast_settings()).unwrap().with_base_url(&base);
    let t0 = Instant::now();
    let err = client.fetch(&SearchQuery::new("aspirin"), 10).await.unwrap_err();

    assert!(matches!(err, ScrapeError::Configuration { source_type: SourceType::Epo, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(t0.elapsed() < Duration::from_millis(500));
}

fn epo_page(begin: usize, end: usize, total: usize) -> String {
    let docs: String = (begin..=end.min(total))
        .map(|i| {
            format!(
                r#"<exchange-document country="EP" doc-number="{:07}" kind="A1">
                     <bibliographic-data><invention-title lang="en">Tablet {}</invention-title></bibliographic-data>
                   </exchange-document>"#,
                i, i
            )
        })
        .collect();
    format!(
        r#"<ops:world-patent-data xmlns:ops="http://ops.epo.org" xmlns="http://www.epo.org/exchange">
             <ops:biblio-search total-result-count="{}"><ops:search-result><exchange-documents>{}</exchange-documents></ops:search-result></ops:biblio-search>
           </ops:world-patent-data>"#,
        total, docs
    )
}

#[tokio::test]
async fn test_epo_token_then_ranged_pages() {
    let token_requests = Arc::new(AtomicUsize::new(0));
    let ranges = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

    let tokens = token_requests.clone();
    let seen = ranges.clone();
    let router = Router::new()
        .route(
            "/auth/accesstoken",
            post(move |headers: HeaderMap| {
                let tokens = tokens.clone();
                async move {
                    tokens.fetch_add(1, Ordering::SeqCst);
                    assert!(headers.get("authorization").is_some());
                    Json(json!({ "access_token": "tok", "expires_in": "1199" }))
                }
            }),
        )
        .route(
            "/rest-services/published-data/search/biblio",
            get(move |headers: HeaderMap| {
                let seen = seen.clone();
                async move {
                    assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
                    let range = headers.get("range").unwrap().to_str().unwrap().to_string();
                    seen.lock().unwrap().push(range.clone());
                    let (b, e) = range.split_once('-').unwrap();
                    epo_page(b.parse().unwrap(), e.parse().unwrap(), 130)
                }
            }),
        );
    let base = serve(router).await;

    let mut settings = fast_settings();
    settings.epo_key = secret_from(Some("key".into()));
    settings.epo_secret = secret_from(Some("secret".into()));
    let client = EpoClient::new(&settings).unwrap().with_base_url(&base);

    let records = client.fetch(&SearchQuery::new("tablet"), 500).await.unwrap();
    assert_eq!(records.len(), 130);
    assert_eq!(token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(*ranges.lock().unwrap(), vec!["1-100", "101-200"]);
}

#[tokio::test]
async fn test_epo_stops_at_the_result_window() {
    let ranges = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let seen = ranges.clone();
    let router = Router::new()
        .route(
            "/auth/accesstoken",
            post(|| async { Json(json!({ "access_token": "tok", "expires_in": 1199 })) }),
        )
        .route(
            "/rest-services/published-data/search/biblio",
            get(move |headers: HeaderMap| {
                let seen = seen.clone();
                async move {
                    let range = headers.get("range").unwrap().to_str().unwrap().to_string();
                    seen.lock().unwrap().push(range.clone());
                    let (b, e) = range.split_once('-').unwrap();
                    let (b, e): (usize, usize) = (b.parse().unwrap(), e.parse().unwrap());
                    if e > 2000 {
                        return (StatusCode::BAD_REQUEST, "range out of bounds").into_response();
                    }
                    epo_page(b, e, 5000).into_response()
                }
            }),
        );
    let base = serve(router).await;

    let mut settings = fast_settings();
    settings.epo_key = secret_from(Some("key".into()));
    settings.epo_secret = secret_from(Some("secret".into()));
    let client = EpoClient::new(&settings).unwrap().with_base_url(&base);

    let records = tokio_test::assert_ok!(client.fetch(&SearchQuery::new("tablet"), 2500).await);
    assert_eq!(records.len(), 2000);
    let ranges = ranges.lock().unwrap();
    assert_eq!(ranges.len(), 20);
    assert_eq!(ranges.last().map(String::as_str), Some("1901-2000"));
}

// ── PubMed ────────────────────────────────────────────────────────────────────

fn efetch_xml(start: usize, size: usize) -> String {
    let articles: String = (start + 1..=start + size)
        .map(|i| {
            format!(
                "<PubmedArticle><MedlineCitation><PMID>{}</PMID><Article><ArticleTitle>Paper {}</ArticleTitle></Article></MedlineCitation></PubmedArticle>",
                i, i
            )
        })
        .collect();
    format!("<PubmedArticleSet>{}</PubmedArticleSet>", articles)
}

#[tokio::test]
async fn test_pubmed_history_search_respects_limit() {
    let router = Router::new()
        .route(
            "/esearch.fcgi",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("usehistory").map(String::as_str), Some("y"));
                Json(json!({ "esearchresult": { "count": "1000", "webenv": "NCID_1", "querykey": "1" } }))
            }),
        )
        .route(
            "/efetch.fcgi",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("WebEnv").map(String::as_str), Some("NCID_1"));
                let start: usize = q["retstart"].parse().unwrap();
                let size: usize = q["retmax"].parse().unwrap();
                efetch_xml(start, size)
            }),
        );
    let base = serve(router).await;

    let client = PubMedClient::new(&fast_settings()).unwrap().with_base_url(&base);
    let records = client.fetch(&SearchQuery::new("aspirin"), 7).await.unwrap();
    assert_eq!(records.len(), 7);
    match &records[6] {
        RawRecord::PubMed(a) => assert_eq!(a.pmid.as_deref(), Some("7")),
        other => panic!("unexpected record {:?}", other),
    }
}

// ── Google Patents ────────────────────────────────────────────────────────────

const SERPAPI_TOTAL: usize = 250;

#[tokio::test]
async fn test_serpapi_pages_do_not_overlap() {
    let nums = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let seen = nums.clone();
    let router = Router::new().route(
        "/search.json",
        get(move |Query(q): Query<HashMap<String, String>>| {
            let seen = seen.clone();
            async move {
                assert_eq!(q.get("api_key").map(String::as_str), Some("serp-key"));
                seen.lock().unwrap().push(q["num"].clone());
                let page: usize = q["page"].parse().unwrap();
                let num: usize = q["num"].parse().unwrap();
                let results: Vec<Value> = ((page - 1) * num..SERPAPI_TOTAL)
                    .take(num)
                    .map(|i| json!({ "patent_id": format!("US{:05}A1", i), "title": format!("Patent {}", i) }))
                    .collect();
                Json(json!({ "organic_results": results }))
            }
        }),
    );
    let base = serve(router).await;

    let mut settings = fast_settings();
    settings.serpapi_key = secret_from(Some("serp-key".into()));
    let client = GooglePatentsClient::new(&settings)
        .unwrap()
        .with_serpapi_url(&format!("{}/search.json", base));

    let records = client.fetch(&SearchQuery::new("aspirin"), 150).await.unwrap();
    let ids: std::collections::HashSet<_> = records
        .iter()
        .map(|r| match r {
            RawRecord::GooglePatents(h) => h.patent_id.clone().unwrap(),
            other => panic!("unexpected record {:?}", other),
        })
        .collect();
    assert_eq!(records.len(), 150);
    assert_eq!(ids.len(), 150);
    assert_eq!(*nums.lock().unwrap(), vec!["100", "100"]);
}

#[tokio::test]
async fn test_google_patents_html_pages_until_empty() {
    let router = Router::new().route(
        "/",
        get(|Query(q): Query<HashMap<String, String>>| async move {
            let page: usize = q["page"].parse().unwrap();
            if page >= 2 {
                return "<html><body></body></html>".to_string();
            }
            (0..3)
                .map(|i| {
                    let id = format!("US{}{}", page, i);
                    format!(r#"<article class="result"><h3>Patent {id}</h3><a href="/patent/{id}/en">x</a></article>"#)
                })
                .collect::<String>()
        }),
    );
    let base = serve(router).await;

    let client = GooglePatentsClient::new(&fast_settings()).unwrap().with_html_url(&format!("{}/", base));
    let records = client.fetch(&SearchQuery::new("aspirin"), 100).await.unwrap();
    assert_eq!(records.len(), 6);
}

// ── Orchestrator + store ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_orchestrated_run_persists_successes_and_reports_failures() {
    let (_, endpoint) = uspto_server(0, 503).await;
    let settings = fast_settings();
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(UsptoClient::new(&settings).unwrap().with_endpoint(&endpoint)),
        Arc::new(EpoClient::new(&settings).unwrap()),
    ];
    let orchestrator = Orchestrator::with_adapters(adapters);

    let report = orchestrator
        .scrape(&"uspto,epo".parse::<SourceSelection>().unwrap(), &SearchQuery::new("aspirin"), 20)
        .await
        .unwrap();

    assert_eq!(report.documents.len(), 20);
    assert!(report.documents.iter().all(|d| d.source == SourceType::Uspto));
    assert!(report.documents[0].chemical_entities.contains("aspirin"));

    let epo = report.summaries.iter().find(|s| s.source == SourceType::Epo).unwrap();
    assert!(matches!(&epo.status, SourceStatus::Failed { kind, .. } if kind == "ConfigurationError"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("uspto.jsonl");
    append_documents(&path, &report.documents).await.unwrap();
    assert_eq!(count_documents(&path).await.unwrap(), 20);
}
