//! chem2textqa-ingestion: Multi-source scrape pipeline.
//! - Source adapters (PubMed, USPTO, EPO, Google Patents)
//! - Normalisation into the shared document schema
//! - Fan-out orchestration with per-source failure containment
//! - Append-only JSONL storage

pub mod dedup;
pub mod models;
pub mod normalise;
pub mod pipeline;
pub mod settings;
pub mod sources;
pub mod store;

pub use models::{RawRecord, ScientificDocument, SearchQuery};
pub use pipeline::{Orchestrator, ScrapeReport, SourceSelection};
pub use settings::ScraperSettings;
