//! Fan-out scrape orchestration.
//!
//! For one query the orchestrator:
//!   1. Resolves the requested sources against the registered adapters
//!   2. Runs every selected adapter concurrently (each paced by its own limiter)
//!   3. Normalises and deduplicates each source's records
//!   4. Hands back one `SourceBatch` per source as soon as that source finishes
//!
//! A failing source is reported in its summary and never aborts the run.
//! Only misuse (zero limit, empty or unknown selection) fails up front,
//! before any network call.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use chem2textqa_common::{Result, ScrapeError, SourceType};

use crate::dedup::Deduplicator;
use crate::models::{ScientificDocument, SearchQuery};
use crate::normalise::normalize_all;
use crate::settings::ScraperSettings;
use crate::sources::epo::EpoClient;
use crate::sources::google_patents::GooglePatentsClient;
use crate::sources::pubmed::PubMedClient;
use crate::sources::uspto::UsptoClient;
use crate::sources::SourceAdapter;

// ── Source selection ──────────────────────────────────────────────────────────

/// Which sources a scrape should hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    All,
    Only(Vec<SourceType>),
}

impl FromStr for SourceSelection {
    type Err = ScrapeError;

    /// Accepts `all`, a single tag, or a comma-separated list of tags.
    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(SourceSelection::All);
        }
        let sources = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<SourceType>().map_err(ScrapeError::InvalidRequest))
            .collect::<Result<Vec<_>>>()?;
        if sources.is_empty() {
            return Err(ScrapeError::InvalidRequest("no sources selected".to_string()));
        }
        Ok(SourceSelection::Only(sources))
    }
}

impl SourceSelection {
    /// Concrete sources to run, in request order without repeats.
    pub fn resolve(&self, available: &[SourceType]) -> Result<Vec<SourceType>> {
        let resolved = match self {
            SourceSelection::All => available.to_vec(),
            SourceSelection::Only(requested) => {
                let mut out: Vec<SourceType> = Vec::with_capacity(requested.len());
                for source in requested {
                    if !available.contains(source) {
                        return Err(ScrapeError::InvalidRequest(format!(
                            "source '{}' is not registered",
                            source
                        )));
                    }
                    if !out.contains(source) {
                        out.push(*source);
                    }
                }
                out
            }
        };
        if resolved.is_empty() {
            return Err(ScrapeError::InvalidRequest("no sources selected".to_string()));
        }
        Ok(resolved)
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Outcome of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Fetched {
        documents: usize,
        /// Records that failed to normalise.
        skipped: usize,
        duplicates: usize,
    },
    Failed {
        kind: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source: SourceType,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub duration_ms: u64,
}

impl SourceSummary {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, SourceStatus::Failed { .. })
    }
}

/// Everything one source produced. Failed sources carry no documents.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub documents: Vec<ScientificDocument>,
    pub summary: SourceSummary,
}

/// Merged result of a whole scrape.
#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    pub documents: Vec<ScientificDocument>,
    pub summaries: Vec<SourceSummary>,
}

impl ScrapeReport {
    pub fn push(&mut self, batch: SourceBatch) {
        self.documents.extend(batch.documents);
        self.summaries.push(batch.summary);
    }

    pub fn failed(&self) -> impl Iterator<Item = &SourceSummary> {
        self.summaries.iter().filter(|s| s.is_failed())
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl Orchestrator {
    /// Register every known source, configured from `settings`.
    pub fn from_settings(settings: &ScraperSettings) -> Result<Self> {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(PubMedClient::new(settings)?),
            Arc::new(GooglePatentsClient::new(settings)?),
            Arc::new(UsptoClient::new(settings)?),
            Arc::new(EpoClient::new(settings)?),
        ];
        Ok(Self::with_adapters(adapters))
    }

    pub fn with_adapters(adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self { adapters }
    }

    /// Registered sources, in canonical order.
    pub fn available(&self) -> Vec<SourceType> {
        SourceType::ALL
            .into_iter()
            .filter(|s| self.adapters.iter().any(|a| a.source() == *s))
            .collect()
    }

    fn plan(&self, selection: &SourceSelection, query: &SearchQuery, limit: usize) -> Result<Vec<Arc<dyn SourceAdapter>>> {
        if limit == 0 {
            return Err(ScrapeError::InvalidRequest("limit must be at least 1".to_string()));
        }
        if query.text.trim().is_empty() {
            return Err(ScrapeError::InvalidRequest("query must not be empty".to_string()));
        }
        if let (Some(from), Some(to)) = (query.date_from, query.date_to) {
            if from > to {
                return Err(ScrapeError::InvalidRequest(format!(
                    "date_from {} is after date_to {}",
                    from, to
                )));
            }
        }
        let sources = selection.resolve(&self.available())?;
        Ok(sources
            .into_iter()
            .filter_map(|s| self.adapters.iter().find(|a| a.source() == s).cloned())
            .collect())
    }

    /// Run the scrape and collect every batch into one report.
    pub async fn scrape(&self, selection: &SourceSelection, query: &SearchQuery, limit: usize) -> Result<ScrapeReport> {
        let adapters = self.plan(selection, query, limit)?;
        let mut running: FuturesUnordered<_> = adapters
            .iter()
            .map(|adapter| run_source(adapter.as_ref(), query, limit))
            .collect();

        let mut report = ScrapeReport::default();
        while let Some(batch) = running.next().await {
            report.push(batch);
        }
        Ok(report)
    }

    /// Streaming variant: each batch is sent on `tx` as soon as its source
    /// finishes. Stops early if the receiver goes away.
    #[instrument(skip(self, selection, query, tx), fields(query = %query.text))]
    pub async fn scrape_into(
        &self,
        selection: &SourceSelection,
        query: &SearchQuery,
        limit: usize,
        tx: mpsc::Sender<SourceBatch>,
    ) -> Result<()> {
        let adapters = self.plan(selection, query, limit)?;
        info!(sources = adapters.len(), limit, "Starting scrape");

        let mut running: FuturesUnordered<_> = adapters
            .iter()
            .map(|adapter| run_source(adapter.as_ref(), query, limit))
            .collect();

        while let Some(batch) = running.next().await {
            if tx.send(batch).await.is_err() {
                warn!("Batch receiver dropped; abandoning remaining sources");
                break;
            }
        }
        Ok(())
    }
}

/// Fetch, normalise and deduplicate one source. Never fails: errors become
/// a `Failed` summary.
async fn run_source(adapter: &dyn SourceAdapter, query: &SearchQuery, limit: usize) -> SourceBatch {
    let source = adapter.source();
    let t0 = Instant::now();

    let (documents, status) = match adapter.fetch(query, limit).await {
        Ok(raws) => {
            let (mut docs, skipped) = normalize_all(source, &raws);
            let duplicates = Deduplicator::new().retain_new(&mut docs);
            info!(source = %source, n = docs.len(), skipped = skipped.len(), duplicates, "Source finished");
            let status = SourceStatus::Fetched {
                documents: docs.len(),
                skipped: skipped.len(),
                duplicates,
            };
            (docs, status)
        }
        Err(e) => {
            warn!(source = %source, error = %e, "Source failed");
            let status = SourceStatus::Failed {
                kind: e.kind().to_string(),
                reason: e.to_string(),
            };
            (Vec::new(), status)
        }
    };

    SourceBatch {
        documents,
        summary: SourceSummary {
            source,
            status,
            duration_ms: t0.elapsed().as_millis() as u64,
        },
    }
}
