use crate::error::ConfigError;
use crate::judge::{
    EXAMPLE_FIELDS, MAX_SAMPLES, QUERY_PASSAGE_FIELDS, ResponseParser, unused_placeholder,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_MODEL: &str = "gpt-4";
const DEFAULT_API_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_ENV_VAR_API_KEY: &str = "OPENAI_API_KEY";

/// Per-1k-token prices for the models the harness has been run against
const KNOWN_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-3.5-turbo", 0.0015, 0.002),
    ("gpt-4", 0.03, 0.06),
    ("text-davinci-003", 0.02, 0.02),
];

/// Request shape used to talk to the judge model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Multi-turn chat completions
    Chat,
    /// Single-prompt legacy completions
    Completion,
}

impl Backend {
    fn for_model(model: &str) -> Self {
        if model.starts_with("text-") {
            Backend::Completion
        } else {
            Backend::Chat
        }
    }
}

/// One turn of a worked example conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// A worked example: the turns shown to the judge before the real pair
pub type Example = Vec<Turn>;

/// Judge settings as they appear in a config file or on the command line.
/// Every field is optional; layers are merged before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeSection {
    pub model: Option<String>,
    pub backend: Option<Backend>,
    pub api_endpoint: Option<String>,
    pub input_1k_token_cost: Option<f64>,
    pub output_1k_token_cost: Option<f64>,
    pub initial_prompt: Option<String>,
    pub initial_prompt_file: Option<PathBuf>,
    pub query_passage_format: Option<String>,
    pub result_regex: Option<String>,
    pub examples: Option<Vec<Example>>,
    pub examples_file: Option<PathBuf>,
    pub example_format: Option<String>,
    pub max_tokens: Option<u16>,
    pub rate_limit_rps: Option<f64>,
    pub request_timeout_secs: Option<u64>,
    pub env_var_api_key: Option<String>,
    pub api_keys_file: Option<PathBuf>,
    pub api_key_name: Option<String>,
}

/// Batch settings as they appear in a config file or on the command line
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    pub corpus: Option<PathBuf>,
    pub completions: Option<u32>,
    pub output: Option<PathBuf>,
    pub history: Option<PathBuf>,
    pub retry_delay_secs: Option<u64>,
    pub multi_sample_retry_delay_secs: Option<u64>,
    pub keep_going: Option<bool>,
    pub no_cache: Option<bool>,
    pub fingerprint_passages: Option<bool>,
}

/// Combined configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub judge: JudgeSection,
    #[serde(default)]
    pub run: RunSection,
}

/// Resolved judge settings, fixed for the whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub model: String,
    pub backend: Backend,
    pub api_endpoint: String,
    pub input_1k_token_cost: f64,
    pub output_1k_token_cost: f64,
    pub initial_prompt: String,
    pub query_passage_format: String,
    pub result_regex: String,
    pub examples: Vec<Example>,
    pub example_format: Option<String>,
    pub max_tokens: u16,
    pub rate_limit_rps: f64,
    pub request_timeout_secs: u64,
}

/// Resolved batch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub corpus: PathBuf,
    pub completions: u32,
    pub output: Option<PathBuf>,
    pub history: Option<PathBuf>,
    pub retry_delay_secs: u64,
    pub multi_sample_retry_delay_secs: u64,
    pub keep_going: bool,
    pub no_cache: bool,
    pub fingerprint_passages: bool,
}

/// Everything a run needs apart from the credential. Recorded in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub judge: JudgeConfig,
    pub run: RunConfig,
}

/// Validated configuration for one run
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub api_key: String,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = read_file(path)?;
        let mut config: FileConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.judge.load_referenced_files(base)?;

        Ok(config)
    }
}

impl JudgeSection {
    /// Inline the prompt and examples files named by this section.
    /// Relative paths are taken from `base`.
    pub fn load_referenced_files(&mut self, base: &Path) -> Result<(), ConfigError> {
        if let Some(file) = self.initial_prompt_file.take() {
            if self.initial_prompt.is_none() {
                self.initial_prompt = Some(load_initial_prompt(&base.join(file))?);
            }
        }
        if let Some(file) = self.examples_file.take() {
            if self.examples.is_none() {
                self.examples = Some(load_examples(&base.join(file))?);
            }
        }
        Ok(())
    }

    /// Fill every unset field from `fallback`
    pub fn or(self, fallback: JudgeSection) -> JudgeSection {
        JudgeSection {
            model: self.model.or(fallback.model),
            backend: self.backend.or(fallback.backend),
            api_endpoint: self.api_endpoint.or(fallback.api_endpoint),
            input_1k_token_cost: self.input_1k_token_cost.or(fallback.input_1k_token_cost),
            output_1k_token_cost: self.output_1k_token_cost.or(fallback.output_1k_token_cost),
            initial_prompt: self.initial_prompt.or(fallback.initial_prompt),
            initial_prompt_file: self.initial_prompt_file.or(fallback.initial_prompt_file),
            query_passage_format: self.query_passage_format.or(fallback.query_passage_format),
            result_regex: self.result_regex.or(fallback.result_regex),
            examples: self.examples.or(fallback.examples),
            examples_file: self.examples_file.or(fallback.examples_file),
            example_format: self.example_format.or(fallback.example_format),
            max_tokens: self.max_tokens.or(fallback.max_tokens),
            rate_limit_rps: self.rate_limit_rps.or(fallback.rate_limit_rps),
            request_timeout_secs: self.request_timeout_secs.or(fallback.request_timeout_secs),
            env_var_api_key: self.env_var_api_key.or(fallback.env_var_api_key),
            api_keys_file: self.api_keys_file.or(fallback.api_keys_file),
            api_key_name: self.api_key_name.or(fallback.api_key_name),
        }
    }
}

impl RunSection {
    /// Fill every unset field from `fallback`
    pub fn or(self, fallback: RunSection) -> RunSection {
        RunSection {
            corpus: self.corpus.or(fallback.corpus),
            completions: self.completions.or(fallback.completions),
            output: self.output.or(fallback.output),
            history: self.history.or(fallback.history),
            retry_delay_secs: self.retry_delay_secs.or(fallback.retry_delay_secs),
            multi_sample_retry_delay_secs: self
                .multi_sample_retry_delay_secs
                .or(fallback.multi_sample_retry_delay_secs),
            keep_going: self.keep_going.or(fallback.keep_going),
            no_cache: self.no_cache.or(fallback.no_cache),
            fingerprint_passages: self.fingerprint_passages.or(fallback.fingerprint_passages),
        }
    }
}

impl Config {
    /// Merge command-line values over the config file and validate the result
    pub fn resolve(overrides: FileConfig, file: FileConfig) -> Result<Self, ConfigError> {
        let judge_section = overrides.judge.or(file.judge);
        let run_section = overrides.run.or(file.run);

        let api_key = resolve_api_key(&judge_section)?;
        let judge = resolve_judge(judge_section)?;
        let run = resolve_run(run_section)?;

        Ok(Config {
            settings: Settings { judge, run },
            api_key,
        })
    }
}

fn resolve_judge(section: JudgeSection) -> Result<JudgeConfig, ConfigError> {
    let model = section.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let known = KNOWN_PRICING.iter().find(|(name, _, _)| *name == model);

    let input_1k_token_cost = section
        .input_1k_token_cost
        .or(known.map(|(_, input, _)| *input))
        .ok_or(ConfigError::Missing("input_1k_token_cost"))?;
    let output_1k_token_cost = section
        .output_1k_token_cost
        .or(known.map(|(_, _, output)| *output))
        .ok_or(ConfigError::Missing("output_1k_token_cost"))?;

    let initial_prompt = section
        .initial_prompt
        .ok_or(ConfigError::Missing("initial_prompt"))?;
    let query_passage_format = section
        .query_passage_format
        .ok_or(ConfigError::Missing("query_passage_format"))?;
    let result_regex = section
        .result_regex
        .ok_or(ConfigError::Missing("result_regex"))?;

    ResponseParser::new(&result_regex)?;
    check_placeholders(
        "query_passage_format",
        &query_passage_format,
        &QUERY_PASSAGE_FIELDS,
        &QUERY_PASSAGE_FIELDS,
    )?;
    if let Some(format) = &section.example_format {
        check_placeholders("example_format", format, &EXAMPLE_FIELDS, &["content"])?;
    }

    Ok(JudgeConfig {
        backend: section.backend.unwrap_or_else(|| Backend::for_model(&model)),
        model,
        api_endpoint: section
            .api_endpoint
            .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
        input_1k_token_cost,
        output_1k_token_cost,
        initial_prompt,
        query_passage_format,
        result_regex,
        examples: section.examples.unwrap_or_default(),
        example_format: section.example_format,
        max_tokens: section.max_tokens.unwrap_or_else(default_max_tokens),
        rate_limit_rps: section.rate_limit_rps.unwrap_or_else(default_rate_limit),
        request_timeout_secs: section.request_timeout_secs.unwrap_or(120),
    })
}

/// A template that drops one of its values would send every request without it
fn check_placeholders(
    field: &'static str,
    template: &str,
    fields: &[&'static str],
    required: &[&'static str],
) -> Result<(), ConfigError> {
    match unused_placeholder(template, fields, required) {
        Some(placeholder) => Err(ConfigError::UnusedPlaceholder { field, placeholder }),
        None => Ok(()),
    }
}

fn resolve_run(section: RunSection) -> Result<RunConfig, ConfigError> {
    let corpus = section.corpus.ok_or(ConfigError::Missing("corpus"))?;

    let completions = section.completions.unwrap_or(1);
    if !(1..=MAX_SAMPLES).contains(&completions) {
        return Err(ConfigError::InvalidSampleCount(completions));
    }

    Ok(RunConfig {
        corpus,
        completions,
        output: section.output,
        history: section.history,
        retry_delay_secs: section.retry_delay_secs.unwrap_or(30),
        multi_sample_retry_delay_secs: section.multi_sample_retry_delay_secs.unwrap_or(60),
        keep_going: section.keep_going.unwrap_or(false),
        no_cache: section.no_cache.unwrap_or(false),
        fingerprint_passages: section.fingerprint_passages.unwrap_or(false),
    })
}

fn default_max_tokens() -> u16 {
    500
}

fn default_rate_limit() -> f64 {
    10.0
}

/// Read the API key from a JSON keys file when one is configured,
/// otherwise from the environment
fn resolve_api_key(section: &JudgeSection) -> Result<String, ConfigError> {
    match &section.api_keys_file {
        Some(path) => {
            let name = section
                .api_key_name
                .as_deref()
                .unwrap_or(DEFAULT_ENV_VAR_API_KEY);
            let content = read_file(path)?;
            let keys: HashMap<String, String> =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            keys.get(name).cloned().ok_or_else(|| {
                ConfigError::Credential(format!("key {} not found in {}", name, path.display()))
            })
        }
        None => {
            let var = section
                .env_var_api_key
                .as_deref()
                .unwrap_or(DEFAULT_ENV_VAR_API_KEY);
            std::env::var(var)
                .map_err(|_| ConfigError::Credential(format!("environment variable {} not found", var)))
        }
    }
}

/// Load the system instruction. The file holds either a `{role, content}`
/// message, a JSON string, or plain text.
pub fn load_initial_prompt(path: &Path) -> Result<String, ConfigError> {
    let content = read_file(path)?;

    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(serde_json::Value::String(prompt)) => Ok(prompt),
        Ok(serde_json::Value::Object(message)) => message
            .get("content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| ConfigError::Parse {
                path: path.display().to_string(),
                reason: "prompt message has no \"content\" string".to_string(),
            }),
        _ => Ok(content.trim().to_string()),
    }
}

/// Load worked examples from a JSON array of conversations
pub fn load_examples(path: &Path) -> Result<Vec<Example>, ConfigError> {
    let content = read_file(path)?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
