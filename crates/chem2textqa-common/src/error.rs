use thiserror::Error;

use crate::source::SourceType;

#[derive(Debug, Error)]
pub enum ScrapeError {
    /// A required credential or setting is absent. Raised before any network call.
    #[error("Configuration error for {source_type}: missing {credential}")]
    Configuration {
        source_type: SourceType,
        credential: String,
    },

    /// A request kept failing until the retry budget ran out, or failed permanently.
    #[error("Fetch failed for {source_type} after {attempts} attempt(s): {last_error}")]
    FetchFailed {
        source_type: SourceType,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    CorruptRecord(#[from] CorruptRecord),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScrapeError {
    /// Stable name of the error class, used in per-source summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::Configuration { .. } => "ConfigurationError",
            ScrapeError::FetchFailed { .. }   => "FetchFailed",
            ScrapeError::Mapping(_)           => "MappingError",
            ScrapeError::CorruptRecord(_)     => "CorruptRecord",
            ScrapeError::InvalidRequest(_)    => "InvalidRequest",
            ScrapeError::Security(_)          => "SecurityError",
            ScrapeError::Io(_)                => "IoError",
            ScrapeError::Serialization(_)     => "SerializationError",
        }
    }
}

/// One raw record could not be turned into a document.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Mapping error for {source_type} record: {reason}")]
pub struct MappingError {
    pub source_type: SourceType,
    pub reason: String,
}

impl MappingError {
    pub fn new(source_type: SourceType, reason: impl Into<String>) -> Self {
        Self { source_type, reason: reason.into() }
    }
}

/// A stored line that could not be parsed. `line` is 1-based.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Corrupt record at line {line}: {reason}")]
pub struct CorruptRecord {
    pub line: usize,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
