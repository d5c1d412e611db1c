use crate::cache::{CacheSnapshot, EvaluationCache};
use crate::config::Settings;
use crate::output::write_atomically;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const HISTORY_VERSION: u32 = 1;

/// Settings and cached evaluations of a previous run, reloaded to resume it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub settings: Settings,
    pub cache: CacheSnapshot,
}

impl RunHistory {
    pub fn new(settings: Settings, cache: &EvaluationCache) -> Self {
        Self {
            version: HISTORY_VERSION,
            saved_at: Utc::now(),
            settings,
            cache: cache.snapshot(),
        }
    }

    /// `None` when no history has been written yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read history: {}", path.display()))?;
        let history: RunHistory = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history: {}", path.display()))?;

        if history.version != HISTORY_VERSION {
            bail!(
                "history {} has version {}, expected {}",
                path.display(),
                history.version,
                HISTORY_VERSION
            );
        }

        Ok(Some(history))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize history to JSON")?;
        write_atomically(path, json.as_bytes())
    }

    pub fn into_cache(self) -> EvaluationCache {
        EvaluationCache::restore(self.cache)
    }
}
