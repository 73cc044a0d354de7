//! chem2textqa-common: Shared types, errors and HTTP plumbing used by every chem2textqa crate.

pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod sandbox;
pub mod source;

// Re-export commonly used types
pub use error::{CorruptRecord, MappingError, Result, ScrapeError};
pub use rate_limit::RateLimiter;
pub use retry::{AttemptError, RetryPolicy, Throttle};
pub use source::SourceType;
