//! Data models for the scrape pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use chem2textqa_common::SourceType;

use crate::sources::epo::EpoDocument;
use crate::sources::google_patents::GooglePatentsHit;
use crate::sources::pubmed::PubMedArticle;
use crate::sources::uspto::UsptoPatent;

/// Unified schema for papers and patents scraped from any source.
///
/// Serialised field names are stable; absent optionals are omitted rather
/// than written as placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScientificDocument {
    pub source: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "abstract", default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<NaiveDate>,
    pub identifiers: BTreeMap<String, String>,
    #[serde(default)]
    pub chemical_entities: BTreeSet<String>,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ScientificDocument {
    /// An empty document for `source`; callers fill fields before use.
    pub fn new(source: SourceType) -> Self {
        Self {
            source,
            title: None,
            abstract_text: None,
            authors: Vec::new(),
            publication_date: None,
            identifiers: BTreeMap::new(),
            chemical_entities: BTreeSet::new(),
            keywords: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// The identifier that names this record within its source.
    pub fn primary_identifier(&self) -> Option<(&str, &str)> {
        const PRIORITY: [&str; 4] = ["pmid", "patent_number", "doi", "pmcid"];
        PRIORITY
            .iter()
            .find_map(|k| self.identifiers.get_key_value(*k))
            .or_else(|| self.identifiers.iter().next())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A source-native record before normalisation. Each variant is only
/// understood by its own source's mapping function.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    PubMed(PubMedArticle),
    Uspto(UsptoPatent),
    Epo(EpoDocument),
    GooglePatents(GooglePatentsHit),
}

impl RawRecord {
    pub fn source(&self) -> SourceType {
        match self {
            RawRecord::PubMed(_)        => SourceType::PubMed,
            RawRecord::Uspto(_)         => SourceType::Uspto,
            RawRecord::Epo(_)           => SourceType::Epo,
            RawRecord::GooglePatents(_) => SourceType::GooglePatents,
        }
    }
}

/// A flat keyword query with an optional publication window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), date_from: None, date_to: None }
    }

    pub fn with_dates(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }
}
