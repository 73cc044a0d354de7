use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::error::ScrapeError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; Chem2TextQA/0.1; research)";

/// An HTTP client that only talks to approved upstream hosts.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl SandboxClient {
    /// Creates a client with the default allowlist, timeout and user agent.
    pub fn new() -> Result<Self, ScrapeError> {
        Self::with_options(DEFAULT_TIMEOUT, DEFAULT_USER_AGENT)
    }

    pub fn with_options(timeout: Duration, user_agent: &str) -> Result<Self, ScrapeError> {
        let allowlist: HashSet<String> = [
            "eutils.ncbi.nlm.nih.gov", // PubMed
            "search.patentsview.org",  // USPTO PatentsView
            "ops.epo.org",             // EPO Open Patent Services
            "patents.google.com",      // Google Patents HTML
            "serpapi.com",             // SerpAPI Google Patents engine
            "localhost",
            "127.0.0.1",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ScrapeError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, allowlist })
    }

    /// Adds the host of `url` to the allowlist. Used when a source is pointed at a mirror.
    pub fn allow_url(&mut self, url: &str) {
        if let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(String::from)) {
            self.allowlist.insert(host);
        }
    }

    /// True when the URL's host, or a parent domain of it, is allowlisted.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_owned)) else {
            return false;
        };
        self.allowlist.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, ScrapeError> {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, ScrapeError> {
        self.request(reqwest::Method::POST, url)
    }

    pub fn request(&self, method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder, ScrapeError> {
        if !self.is_allowed(url) {
            return Err(ScrapeError::Security(format!("host of {} is not an approved upstream", url)));
        }
        Ok(self.client.request(method, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_accepts_upstreams_and_subdomains() {
        let client = SandboxClient::new().unwrap();
        assert!(client.is_allowed("https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi"));
        assert!(client.is_allowed("https://ops.epo.org/3.2/auth/accesstoken"));
        assert!(client.is_allowed("http://127.0.0.1:8080/api/v1/patent/"));
        assert!(!client.is_allowed("https://example.com/"));
        assert!(!client.is_allowed("not a url"));
    }

    #[test]
    fn test_disallowed_url_is_a_security_error() {
        let client = SandboxClient::new().unwrap();
        let err = client.get("https://evil.example.org/").unwrap_err();
        assert_eq!(err.kind(), "SecurityError");
    }

    #[test]
    fn test_allow_url_registers_host() {
        let mut client = SandboxClient::new().unwrap();
        client.allow_url("https://mirror.example.net/api");
        assert!(client.is_allowed("https://mirror.example.net/other"));
    }
}
