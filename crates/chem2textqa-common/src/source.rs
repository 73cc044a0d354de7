//! The fixed set of upstream data sources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    PubMed,
    Uspto,
    Epo,
    GooglePatents,
}

impl SourceType {
    /// Every known source, in registry order.
    pub const ALL: [SourceType; 4] = [
        SourceType::PubMed,
        SourceType::GooglePatents,
        SourceType::Uspto,
        SourceType::Epo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::PubMed        => "pubmed",
            SourceType::Uspto         => "uspto",
            SourceType::Epo           => "epo",
            SourceType::GooglePatents => "google_patents",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        SourceType::ALL
            .iter()
            .copied()
            .find(|src| src.as_str() == tag)
            .ok_or_else(|| {
                let available: Vec<&str> = SourceType::ALL.iter().map(|s| s.as_str()).collect();
                format!("Unknown source '{}'. Available: {}", s.trim(), available.join(", "))
            })
    }
}
