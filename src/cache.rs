use crate::error::CacheWriteConflict;
use crate::models::{DocumentKey, EvaluationResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Write-once mapping from document key to judge result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationCache {
    entries: HashMap<DocumentKey, EvaluationResult>,
}

/// Serializable form of an [`EvaluationCache`], entries sorted by key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: DocumentKey,
    pub result: EvaluationResult,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &DocumentKey) -> Option<&EvaluationResult> {
        self.entries.get(key)
    }

    /// Store the first result for `key`. A key is never overwritten.
    pub fn insert(
        &mut self,
        key: DocumentKey,
        mut result: EvaluationResult,
    ) -> Result<(), CacheWriteConflict> {
        if self.entries.contains_key(&key) {
            return Err(CacheWriteConflict {
                key: key.as_str().to_string(),
            });
        }

        result.saved_cost = 0.0;
        self.entries.insert(key, result);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .map(|(key, result)| CacheEntry {
                key: key.clone(),
                result: result.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        CacheSnapshot { entries }
    }

    /// Rebuild a cache from a snapshot. Should the snapshot list a key twice,
    /// the first entry wins, as it would have on insert.
    pub fn restore(snapshot: CacheSnapshot) -> Self {
        let mut entries = HashMap::with_capacity(snapshot.entries.len());
        for entry in snapshot.entries {
            entries.entry(entry.key).or_insert(entry.result);
        }
        Self { entries }
    }
}
