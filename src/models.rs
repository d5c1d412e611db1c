use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a (query, passage) pair in the evaluation cache
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Key formed from the query text and the passage identifier
    pub fn new(query: &str, passage_id: &str) -> Self {
        Self(format!("{}_{}", query, passage_id))
    }

    /// Key that additionally pins the passage content, so an edited passage
    /// under an unchanged identifier is judged again
    pub fn with_fingerprint(query: &str, passage_id: &str, passage: &str) -> Self {
        let digest = Sha256::digest(passage.as_bytes());
        let fingerprint: String = digest
            .iter()
            .take(8)
            .map(|byte| format!("{:02x}", byte))
            .collect();
        Self(format!("{}_{}#{}", query, passage_id, fingerprint))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token counts reported by the judge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One independent judge reply, parsed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub score: Option<i64>,
    pub reasoning: Option<String>,
}

impl Sample {
    /// Sample whose reply did not match the expected pattern
    pub fn unparsed() -> Self {
        Self::default()
    }
}

/// What the judge concluded about a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Single {
        score: Option<i64>,
        reasoning: Option<String>,
    },
    Multi {
        samples: Vec<Sample>,
        /// Filled in by the aggregator once all samples are in
        score: Option<i64>,
    },
}

impl Verdict {
    pub fn score(&self) -> Option<i64> {
        match self {
            Verdict::Single { score, .. } | Verdict::Multi { score, .. } => *score,
        }
    }
}

/// Outcome of judging one document key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    pub usage: TokenUsage,
    /// Money spent producing this result during the current run
    pub cost: f64,
    /// Wall-clock seconds spent in the judge call
    pub duration: f64,
    /// Money this run avoided spending because the result was cached
    #[serde(default)]
    pub saved_cost: f64,
}

impl EvaluationResult {
    /// Copy of a cached result as reported on a cache hit
    pub fn as_cache_hit(&self) -> Self {
        let mut hit = self.clone();
        hit.saved_cost = self.cost;
        hit.cost = 0.0;
        hit
    }

    pub fn score(&self) -> Option<i64> {
        self.verdict.score()
    }
}

/// One input row of the corpus
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusRow {
    pub query: String,
    pub passage: String,
    pub passage_id: String,
    /// Every cell of the original row, in header order
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Fresh judge call made during this run
    Judged(EvaluationResult),
    /// Answered from the cache, with the cost moved to `saved_cost`
    Cached(EvaluationResult),
    /// Row kept in the output after its judge calls failed
    Failed(String),
}

/// A corpus row paired with what the batch made of it
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedRow {
    pub row: CorpusRow,
    pub outcome: Outcome,
}

impl EvaluatedRow {
    pub fn result(&self) -> Option<&EvaluationResult> {
        match &self.outcome {
            Outcome::Judged(result) | Outcome::Cached(result) => Some(result),
            Outcome::Failed(_) => None,
        }
    }
}
