//! Upstream source adapters.

pub mod epo;
pub mod google_patents;
pub mod pubmed;
pub mod uspto;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use chem2textqa_common::{Result, SourceType};

use crate::models::{RawRecord, SearchQuery};

/// Common interface for all source adapters.
///
/// `fetch` pages through the upstream until `limit` records are collected or
/// the source runs dry. It never returns more than `limit` records and never
/// requests a page once the budget is met.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceType;

    async fn fetch(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawRecord>>;
}

/// Size of the next page request: never more than what is still needed.
pub(crate) fn next_page_size(collected: usize, limit: usize, max_page: usize) -> usize {
    limit.saturating_sub(collected).min(max_page)
}

/// Decode each entry of a JSON result array on its own. Entries that do not
/// fit `T` are logged and dropped so one bad record never costs the page.
pub(crate) fn decode_each<T: DeserializeOwned>(source: SourceType, entries: Vec<Value>) -> Vec<T> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(source = %source, index, error = %e, "Skipping undecodable record");
                None
            }
        })
        .collect()
}

/// Collapse runs of whitespace and trim; empty strings become `None`.
pub(crate) fn clean_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() { None } else { Some(joined) }
}
