use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;


/// Tuning knobs and heuristic tables for the search engine.
///
/// Every value has a default that matches the behavior observed against
/// common directory servers; tests override individual fields.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Result counts that are well-known default server size limits. A probe
    /// returning exactly one of these is assumed to have been cut off.
    pub truncation_sizes: BTreeSet<usize>,

    /// Attributes usable as chunk boundaries, most preferred first.
    pub sort_attribute_candidates: Vec<String>,

    /// Used when the filter mentions none of the candidates.
    pub default_sort_attribute: String,

    pub default_page_size: usize,
    pub chunk_size: usize,
    pub max_pages: usize,
    pub max_chunks: usize,

    /// Minimum number of entries collected by cookie paging before a
    /// size-limit-exceeded answer is taken as a cumulative server cap
    /// (and chunking is attempted) instead of a plain stop.
    pub chunking_threshold: usize,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            truncation_sizes: [350, 500, 1000, 2000, 5000].into_iter().collect(),
            sort_attribute_candidates: ["uid", "uidNumber", "cn", "sn", "mail", "entryDN"]
                .into_iter()
                .map(|s| s.to_owned())
                .collect(),
            default_sort_attribute: "uid".to_owned(),
            default_page_size: 500,
            chunk_size: 250,
            max_pages: 200,
            max_chunks: 2500,
            chunking_threshold: 300,
        }
    }
}
impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_page_size == 0 {
            return Err(ConfigError::Invalid("default_page_size must be positive".to_owned()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".to_owned()));
        }
        if self.default_sort_attribute.trim().is_empty() {
            return Err(ConfigError::Invalid("default_sort_attribute must not be empty".to_owned()));
        }
        Ok(())
    }
}
