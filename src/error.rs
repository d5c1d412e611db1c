use async_openai::error::OpenAIError;
use thiserror::Error;

/// A judge call that did not produce a usable result. Retried once by the batch loop.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge API call failed: {0}")]
    Api(#[from] OpenAIError),

    #[error("judge reply carried no token usage")]
    MissingUsage,

    #[error("judge returned {received} choices, expected {expected}")]
    MissingChoices { expected: u32, received: usize },

    #[error("sample count {0} is outside 1..=128")]
    SampleCount(u32),
}

/// Attempt to store a second result under a key that is already cached.
#[derive(Debug, Error, PartialEq)]
#[error("evaluation cache already holds key {key:?}")]
pub struct CacheWriteConflict {
    pub key: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("\"{0}\" needs to be defined")]
    Missing(&'static str),

    #[error("invalid result regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("result regex must declare at least two capture groups (reasoning, score), found {0}")]
    RegexGroups(usize),

    #[error("\"{field}\" never places the {placeholder}; use {{{placeholder}}} or a positional {{}}")]
    UnusedPlaceholder {
        field: &'static str,
        placeholder: &'static str,
    },

    #[error("completions must be between 1 and 128, got {0}")]
    InvalidSampleCount(u32),

    #[error("API credential unavailable: {0}")]
    Credential(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus is missing required column \"{0}\"")]
    MissingColumn(&'static str),

    #[error("malformed corpus row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("failed to read corpus: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("row {row} ({key}) could not be judged after retry: {source}")]
    Judge {
        row: usize,
        key: String,
        #[source]
        source: JudgeError,
    },

    #[error(transparent)]
    Cache(#[from] CacheWriteConflict),

    #[error("failed to flush progress: {0:#}")]
    Sink(anyhow::Error),
}
