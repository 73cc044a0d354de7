//! Best-effort chemical entity extraction from free text.
//!
//! Uses the `aho-corasick` crate for linear-time, case-insensitive matching
//! against an embedded compound list. Matches must sit on word boundaries.

use aho_corasick::{AhoCorasick, MatchKind};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::warn;

/// Common drugs, excipients and reference compounds seen in
/// pharmacology abstracts and pharmaceutical patents.
const COMPOUNDS: &[&str] = &[
    "acetaminophen", "acetylsalicylic acid", "adalimumab", "albuterol", "amlodipine",
    "amoxicillin", "ampicillin", "aspirin", "atorvastatin", "azithromycin",
    "bevacizumab", "bortezomib", "budesonide", "caffeine", "capecitabine",
    "carboplatin", "cetuximab", "ciprofloxacin", "cisplatin", "clopidogrel",
    "cyclophosphamide", "cyclosporine", "dexamethasone", "diazepam", "diclofenac",
    "digoxin", "docetaxel", "doxorubicin", "erlotinib", "ethanol",
    "etoposide", "fluorouracil", "fluoxetine", "gefitinib", "gemcitabine",
    "glucose", "heparin", "hydrochlorothiazide", "hydrocortisone", "ibuprofen",
    "imatinib", "insulin", "irinotecan", "lactose", "levothyroxine",
    "lisinopril", "losartan", "magnesium stearate", "metformin", "methotrexate",
    "metoprolol", "morphine", "naproxen", "nicotine", "nivolumab",
    "omeprazole", "oxaliplatin", "paclitaxel", "pembrolizumab", "penicillin",
    "polyethylene glycol", "prednisone", "rapamycin", "rituximab", "sildenafil",
    "simvastatin", "sirolimus", "sorafenib", "sotorasib", "sunitinib",
    "tacrolimus", "tamoxifen", "temozolomide", "testosterone", "trastuzumab",
    "vancomycin", "vincristine", "warfarin",
];

fn automaton() -> Option<&'static AhoCorasick> {
    static AUTOMATON: OnceLock<Option<AhoCorasick>> = OnceLock::new();
    AUTOMATON
        .get_or_init(|| {
            // LeftmostLongest prefers "acetylsalicylic acid" over a shorter overlap
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostLongest)
                .build(COMPOUNDS)
                .map_err(|e| warn!("Failed to build compound automaton: {}", e))
                .ok()
        })
        .as_ref()
}

/// Canonical names of every dictionary compound mentioned in `text`.
pub fn extract_chemicals(text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let Some(ac) = automaton() else { return found };

    for m in ac.find_iter(text) {
        let before = text[..m.start()].chars().next_back();
        let after = text[m.end()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
        if boundary(before) && boundary(after) {
            found.insert(COMPOUNDS[m.pattern().as_usize()].to_string());
        }
    }
    found
}

/// Add `found` to `into`, skipping names already present in another casing.
pub fn merge(into: &mut BTreeSet<String>, found: BTreeSet<String>) {
    for name in found {
        if !into.iter().any(|existing| existing.eq_ignore_ascii_case(&name)) {
            into.insert(name);
        }
    }
}
