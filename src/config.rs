use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Language;
use crate::error::HarvestError;

pub const DEFAULT_SPARQL_URL: &str = "https://query.wikidata.org/sparql";
pub const DEFAULT_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const CONFIG_FILE_NAME: &str = "wdtools.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub sparql_url: String,
    pub api_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub language: Language,
    pub label_cache: Option<Utf8PathBuf>,
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sparql_url: DEFAULT_SPARQL_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: format!("wdtools/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 60,
            max_retries: 100,
            retry_backoff_ms: 1000,
            language: Language::default(),
            label_cache: None,
            chunk_size: 50,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Label cache location; one file per language so caches never mix.
    pub fn label_cache_path(&self) -> Result<Utf8PathBuf, HarvestError> {
        if let Some(path) = &self.label_cache {
            return Ok(path.clone());
        }
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("wdtools")).ok()
            })
            .map(|dir| dir.join(format!("labels.{}.json", self.language)))
            .ok_or_else(|| HarvestError::Filesystem("unable to resolve cache directory".to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path` if given, else `wdtools.json` in the working directory, else defaults.
    pub fn resolve(path: Option<&str>) -> Result<Config, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };

        if !config_path.exists() {
            return match path {
                Some(_) => Err(HarvestError::MissingConfig(config_path)),
                None => Ok(Config::default()),
            };
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, HarvestError> {
        let config: Config = serde_json::from_str(content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;
        if config.chunk_size == 0 {
            return Err(HarvestError::ConfigParse(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
