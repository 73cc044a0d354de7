//! Configuration loading for chem2textqa.
//! Reads chem2textqa.toml from the current directory or the path in
//! CHEM2TEXTQA_CONFIG, then applies environment overrides.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use chem2textqa_ingestion::settings::secret_from;
use chem2textqa_ingestion::ScraperSettings;

pub const CONFIG_ENV: &str = "CHEM2TEXTQA_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "chem2textqa.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Where `<source>.jsonl` files land when no explicit output is given.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Log filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub scraper: ScraperSettings,
}

fn default_output_dir() -> PathBuf { PathBuf::from("./data") }
fn default_log_level()  -> String  { "info".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            scraper: ScraperSettings::default(),
        }
    }
}


impl Config {
    /// Config file path: CHEM2TEXTQA_CONFIG if set, else ./chem2textqa.toml.
    pub fn path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load the config file (defaults when absent) and apply environment
    /// overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::from_file(&Self::path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment variables win over file values. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let scraper = &mut self.scraper;
        let secrets = [
            ("NCBI_API_KEY", &mut scraper.ncbi_api_key),
            ("USPTO_API_KEY", &mut scraper.uspto_api_key),
            ("EPO_KEY", &mut scraper.epo_key),
            ("EPO_SECRET", &mut scraper.epo_secret),
            ("SERPAPI_KEY", &mut scraper.serpapi_key),
        ];
        for (var, slot) in secrets {
            if let Some(secret) = secret_from(lookup(var)) {
                *slot = Some(secret);
            }
        }

        let non_blank = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(email) = non_blank("NCBI_EMAIL") {
            self.scraper.ncbi_email = email;
        }
        if let Some(dir) = non_blank("CHEM2TEXTQA_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(level) = non_blank("CHEM2TEXTQA_LOG_LEVEL") {
            self.log_level = level;
        }
    }
}
