//! Unified document mapper.
//!
//! `normalize` is pure: the same raw record always yields the same document.
//! Per-source field tables live next to each adapter's raw record type.

pub mod chemicals;
pub mod dates;

use chem2textqa_common::{MappingError, SourceType};
use tracing::warn;

use crate::models::{RawRecord, ScientificDocument};
use crate::sources::{epo, google_patents, pubmed, uspto};

/// Convert one source-native record into the shared schema.
pub fn normalize(source: SourceType, raw: &RawRecord) -> Result<ScientificDocument, MappingError> {
    if raw.source() != source {
        return Err(MappingError::new(
            source,
            format!("record belongs to {}, not {}", raw.source(), source),
        ));
    }

    let doc = match raw {
        RawRecord::PubMed(article)    => pubmed::to_document(article)?,
        RawRecord::Uspto(patent)      => uspto::to_document(patent)?,
        RawRecord::Epo(document)      => epo::to_document(document)?,
        RawRecord::GooglePatents(hit) => google_patents::to_document(hit)?,
    };

    if doc.identifiers.is_empty() {
        return Err(MappingError::new(source, "record has no identifier"));
    }
    Ok(doc)
}

/// Normalise a batch, dropping (and logging) records that fail to map.
pub fn normalize_all(
    source: SourceType,
    raws: &[RawRecord],
) -> (Vec<ScientificDocument>, Vec<MappingError>) {
    let mut docs = Vec::with_capacity(raws.len());
    let mut skipped = Vec::new();
    for raw in raws {
        match normalize(source, raw) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                warn!(source = %source, error = %e, "Skipping record that failed to normalise");
                skipped.push(e);
            }
        }
    }
    (docs, skipped)
}
