//! Seed-set loading: where a freshly launched node finds its first peers.
//!
//! A seed source is a JSON document `{"seeds": [...]}` fetched over HTTP,
//! read from a file, or an inline `list:a,b,c`. The node picks a few entries
//! at random so a cluster started from one shared seed list does not all
//! dial the same peer.

use std::collections::HashSet;

use rand::seq::IteratorRandom;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeedsError {
    #[error("could not load seeds URL: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not load seeds URL: status {0}")]
    Status(u16),
    #[error("could not read seeds file: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad seeds document: {0}")]
    Syntax(&'static str),
    #[error("bad seeds document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone)]
pub struct Seeds {
    /// Everything the source listed, for reporting.
    pub all_seeds: HashSet<String>,
    /// The candidates we may dial: everything except ourselves.
    seeds: HashSet<String>,
}

impl Seeds {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a seed set from `http(s)://...`, `list:a,b,c`, `file:path`, or a
    /// bare filename. `exclude` is our own identity and is never a candidate.
    pub async fn load(text: &str, exclude: Option<&str>) -> Result<Self, SeedsError> {
        let all_seeds = if text.starts_with("http://") || text.starts_with("https://") {
            let response = reqwest::get(text).await?;
            if !response.status().is_success() {
                return Err(SeedsError::Status(response.status().as_u16()));
            }
            Self::parse_json(&response.text().await?)?
        } else if let Some(list) = text.strip_prefix("list:") {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            let path = text.strip_prefix("file:").unwrap_or(text);
            Self::parse_json(&std::fs::read_to_string(path)?)?
        };
        let mut seeds = all_seeds.clone();
        if let Some(exclude) = exclude {
            seeds.remove(exclude);
        }
        Ok(Self { all_seeds, seeds })
    }

    fn parse_json(text: &str) -> Result<HashSet<String>, SeedsError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let object = value
            .as_object()
            .ok_or(SeedsError::Syntax("top-level object is not a dictionary"))?;
        let entries = object
            .get("seeds")
            .ok_or(SeedsError::Syntax("no seeds key in configuration"))?
            .as_array()
            .ok_or(SeedsError::Syntax("seeds is not a list"))?;
        let mut seeds = HashSet::new();
        for entry in entries {
            let seed = entry
                .as_str()
                .ok_or(SeedsError::Syntax("seed is not a string"))?;
            seeds.insert(seed.to_string());
        }
        Ok(seeds)
    }

    /// A random sample of up to `n` candidates.
    pub fn choose(&self, n: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        self.seeds
            .iter()
            .cloned()
            .choose_multiple(&mut rng, n.min(self.seeds.len()))
    }
}
