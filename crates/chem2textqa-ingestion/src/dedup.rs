//! Within-run deduplication of normalised documents.
//!
//! Paged upstreams can return the same record twice (shifting result
//! windows, overlapping HTML pages). A document is a duplicate when another
//! document from the same source already carried its primary identifier.
//! Nothing here looks at previously written output.

use std::collections::HashSet;

use chem2textqa_common::SourceType;

use crate::models::ScientificDocument;

/// Result of a deduplication check.
#[derive(Debug, PartialEq, Eq)]
pub enum DedupResult {
    /// Document is new; keep it.
    New,
    /// Same source, same primary identifier as an earlier document.
    DuplicateId { kind: String, value: String },
}

/// Remembers the identifiers seen so far in one run.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<(SourceType, String, String)>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `doc` and remember it if new.
    pub fn check(&mut self, doc: &ScientificDocument) -> DedupResult {
        let Some((kind, value)) = doc.primary_identifier() else {
            return DedupResult::New;
        };
        let key = (doc.source, kind.to_string(), normalise_id(value));
        if self.seen.contains(&key) {
            return DedupResult::DuplicateId { kind: key.1, value: value.to_string() };
        }
        self.seen.insert(key);
        DedupResult::New
    }

    /// Drop duplicates from `docs`, preserving order. Returns the number removed.
    pub fn retain_new(&mut self, docs: &mut Vec<ScientificDocument>) -> usize {
        let before = docs.len();
        docs.retain(|doc| self.check(doc) == DedupResult::New);
        before - docs.len()
    }
}

/// Identifiers compare case-insensitively with surrounding whitespace ignored
/// (DOIs are case-insensitive; patent numbers arrive in mixed case).
fn normalise_id(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(source: SourceType, kind: &str, value: &str) -> ScientificDocument {
        let mut d = ScientificDocument::new(source);
        d.identifiers.insert(kind.into(), value.into());
        d
    }

    #[test]
    fn test_first_sighting_is_new() {
        let mut dedup = Deduplicator::new();
        assert_eq!(dedup.check(&doc(SourceType::PubMed, "pmid", "1")), DedupResult::New);
    }

    #[test]
    fn test_repeat_within_source_is_duplicate() {
        let mut dedup = Deduplicator::new();
        dedup.check(&doc(SourceType::Uspto, "patent_number", "11000001"));
        let result = dedup.check(&doc(SourceType::Uspto, "patent_number", " 11000001 "));
        assert!(matches!(result, DedupResult::DuplicateId { ref kind, .. } if kind == "patent_number"));
    }

    #[test]
    fn test_same_id_in_other_source_is_kept() {
        let mut dedup = Deduplicator::new();
        dedup.check(&doc(SourceType::Epo, "patent_number", "EP1A1"));
        assert_eq!(dedup.check(&doc(SourceType::GooglePatents, "patent_number", "EP1A1")), DedupResult::New);
    }

    #[test]
    fn test_case_insensitive_doi() {
        let mut dedup = Deduplicator::new();
        dedup.check(&doc(SourceType::PubMed, "doi", "10.1000/ABC"));
        assert_ne!(dedup.check(&doc(SourceType::PubMed, "doi", "10.1000/abc")), DedupResult::New);
    }

    #[test]
    fn test_retain_new_preserves_order() {
        let mut dedup = Deduplicator::new();
        let mut docs = vec![
            doc(SourceType::PubMed, "pmid", "1"),
            doc(SourceType::PubMed, "pmid", "2"),
            doc(SourceType::PubMed, "pmid", "1"),
            doc(SourceType::PubMed, "pmid", "3"),
        ];
        assert_eq!(dedup.retain_new(&mut docs), 1);
        let ids: Vec<_> = docs.iter().map(|d| d.identifiers["pmid"].as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
