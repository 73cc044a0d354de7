//! Explicit scraper configuration, passed into the orchestrator at start.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use chem2textqa_common::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct ScraperSettings {
    /// NCBI / PubMed. Optional; raises the polite rate from 3 to 10 req/s.
    #[serde(default, deserialize_with = "de_secret")]
    pub ncbi_api_key: Option<SecretString>,
    #[serde(default = "default_ncbi_email")]
    pub ncbi_email: String,

    /// USPTO PatentsView. Required by the search API.
    #[serde(default, deserialize_with = "de_secret")]
    pub uspto_api_key: Option<SecretString>,

    /// EPO Open Patent Services consumer key and secret. Both required.
    #[serde(default, deserialize_with = "de_secret")]
    pub epo_key: Option<SecretString>,
    #[serde(default, deserialize_with = "de_secret")]
    pub epo_secret: Option<SecretString>,

    /// SerpAPI key. Without it Google Patents falls back to HTML scraping.
    #[serde(default, deserialize_with = "de_secret")]
    pub serpapi_key: Option<SecretString>,

    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limits: RateLimits,
}

fn default_ncbi_email() -> String { "chem2textqa@example.com".to_string() }
fn default_limit()      -> usize  { 100 }

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            ncbi_api_key: None,
            ncbi_email: default_ncbi_email(),
            uspto_api_key: None,
            epo_key: None,
            epo_secret: None,
            serpapi_key: None,
            default_limit: default_limit(),
            http: HttpSettings::default(),
            retry: RetryPolicy::default(),
            rate_limits: RateLimits::default(),
        }
    }
}

impl ScraperSettings {
    /// Requests per second for NCBI: 10 with an API key, 3 without, unless overridden.
    pub fn ncbi_rate_limit(&self) -> f64 {
        self.rate_limits
            .pubmed
            .unwrap_or(if self.ncbi_api_key.is_some() { 10.0 } else { 3.0 })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64    { 30 }
fn default_user_agent()   -> String { chem2textqa_common::sandbox::DEFAULT_USER_AGENT.to_string() }

impl Default for HttpSettings {
    fn default() -> Self {
        Self { timeout_secs: default_timeout_secs(), user_agent: default_user_agent() }
    }
}

/// Requests per second per source.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimits {
    /// Derived from key presence when unset.
    #[serde(default)]
    pub pubmed: Option<f64>,
    /// PatentsView allows 45 requests/minute.
    #[serde(default = "default_uspto_rps")]
    pub uspto: f64,
    #[serde(default = "default_one_rps")]
    pub epo: f64,
    #[serde(default = "default_one_rps")]
    pub google_patents: f64,
}

fn default_uspto_rps() -> f64 { 0.75 }
fn default_one_rps()   -> f64 { 1.0 }

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            pubmed: None,
            uspto: default_uspto_rps(),
            epo: default_one_rps(),
            google_patents: default_one_rps(),
        }
    }
}

/// Empty or whitespace-only values count as absent.
fn de_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(secret_from(raw))
}

pub fn secret_from(raw: Option<String>) -> Option<SecretString> {
    raw.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

pub(crate) fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}
