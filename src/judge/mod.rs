//! LLM-backed relevance judge.
//!
//! A [`Judge`] scores one (query, passage) pair, optionally drawing several
//! independent samples. Two backends speak the OpenAI-compatible API: chat
//! completions and legacy single-prompt completions. The backend is chosen
//! once by [`build_judge`].

mod chat;
mod completion;
mod parse;

pub use chat::ChatJudge;
pub use completion::CompletionJudge;
pub use parse::ResponseParser;

use crate::config::{Backend, Example, JudgeConfig, Turn};
use crate::error::{ConfigError, JudgeError};
use crate::models::{EvaluationResult, Sample, TokenUsage, Verdict};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

/// Most samples one call may request
pub const MAX_SAMPLES: u32 = 128;

#[async_trait]
pub trait Judge: Send + Sync {
    /// Score a pair. One sample gives a single-sample verdict at temperature 0,
    /// more give a multi-sample verdict whose score is left for aggregation.
    async fn evaluate(
        &self,
        query: &str,
        passage: &str,
        sample_count: u32,
    ) -> Result<EvaluationResult, JudgeError>;

    fn model_name(&self) -> &str;
}

/// Build the judge for the configured backend
pub fn build_judge(config: &JudgeConfig, api_key: &str) -> Result<Box<dyn Judge>, ConfigError> {
    let client = openai_client(config, api_key)?;
    let parser = ResponseParser::new(&config.result_regex)?;

    Ok(match config.backend {
        Backend::Chat => Box::new(ChatJudge::new(client, config, parser)),
        Backend::Completion => Box::new(CompletionJudge::new(client, config, parser)),
    })
}

fn openai_client(config: &JudgeConfig, api_key: &str) -> Result<Client<OpenAIConfig>, ConfigError> {
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;

    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(&config.api_endpoint);

    // One HTTP attempt per evaluate call; the batch owns the retry
    let no_retries = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build();

    Ok(Client::with_config(openai_config)
        .with_http_client(http_client)
        .with_backoff(no_retries))
}

/// Token prices, per thousand tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_1k: f64,
    pub output_1k: f64,
}

impl Pricing {
    pub fn from_config(config: &JudgeConfig) -> Self {
        Self {
            input_1k: config.input_1k_token_cost,
            output_1k: config.output_1k_token_cost,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.prompt_tokens as f64 / 1000.0 * self.input_1k
            + usage.completion_tokens as f64 / 1000.0 * self.output_1k
    }
}

/// Prompt pieces fixed for the run
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub initial_prompt: String,
    query_passage_format: String,
    examples: Vec<Example>,
    example_format: Option<String>,
}

impl PromptTemplate {
    pub fn from_config(config: &JudgeConfig) -> Self {
        Self {
            initial_prompt: config.initial_prompt.clone(),
            query_passage_format: config.query_passage_format.clone(),
            examples: config.examples.clone(),
            example_format: config.example_format.clone(),
        }
    }

    pub fn has_examples(&self) -> bool {
        !self.examples.is_empty()
    }

    /// The text that asks the judge about this pair
    pub fn query_passage(&self, query: &str, passage: &str) -> String {
        fill_placeholders(
            &self.query_passage_format,
            &[(QUERY_PASSAGE_FIELDS[0], passage), (QUERY_PASSAGE_FIELDS[1], query)],
        )
    }

    /// Worked example turns in order. User turns go through the example
    /// format, numbered from 1 per example.
    pub fn example_turns(&self) -> Vec<Turn> {
        let mut turns = Vec::new();

        for (i, example) in self.examples.iter().enumerate() {
            let index = (i + 1).to_string();
            for turn in example {
                let content = match (&self.example_format, turn.role.as_str()) {
                    (Some(format), "user") => fill_placeholders(
                        format,
                        &[
                            (EXAMPLE_FIELDS[0], index.as_str()),
                            (EXAMPLE_FIELDS[1], turn.content.as_str()),
                        ],
                    ),
                    _ => turn.content.clone(),
                };
                turns.push(Turn {
                    role: turn.role.clone(),
                    content,
                });
            }
        }

        turns
    }
}

/// Values of the pair template, in positional order
pub const QUERY_PASSAGE_FIELDS: [&str; 2] = ["passage", "query"];
/// Values of the example template, in positional order
pub const EXAMPLE_FIELDS: [&str; 2] = ["index", "content"];

/// Replace placeholders in one pass, so substituted text is never scanned
/// again. `{name}` looks a value up by name, `{0}` by position, and `{}`
/// takes the next value in order.
fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    let mut next_positional = 0;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let substituted = after.find('}').and_then(|close| {
            let name = &after[..close];
            let value = if name.is_empty() {
                next_positional += 1;
                values.get(next_positional - 1)
            } else if let Ok(position) = name.parse::<usize>() {
                values.get(position)
            } else {
                values.iter().find(|(key, _)| *key == name)
            };
            value.map(|(_, value)| (*value, close))
        });

        match substituted {
            Some((value, close)) => {
                rendered.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                rendered.push('{');
                rest = after;
            }
        }
    }
    rendered.push_str(rest);

    rendered
}

/// The first of `required` that `template` never renders, given the value
/// names in positional order
pub fn unused_placeholder(
    template: &str,
    fields: &[&'static str],
    required: &[&'static str],
) -> Option<&'static str> {
    let marker = |field: &str| format!("\u{1}{}\u{1}", field);
    let markers: Vec<String> = fields.iter().map(|field| marker(field)).collect();
    let values: Vec<(&str, &str)> = fields
        .iter()
        .zip(&markers)
        .map(|(field, marker)| (*field, marker.as_str()))
        .collect();

    let rendered = fill_placeholders(template, &values);
    required
        .iter()
        .copied()
        .find(|field| !rendered.contains(&marker(field)))
}

/// Sampling temperature: deterministic for one sample, spread for several
pub fn temperature_for(sample_count: u32) -> f32 {
    if sample_count > 1 { 1.0 } else { 0.0 }
}

fn checked_sample_count(sample_count: u32) -> Result<u8, JudgeError> {
    if !(1..=MAX_SAMPLES).contains(&sample_count) {
        return Err(JudgeError::SampleCount(sample_count));
    }
    u8::try_from(sample_count).map_err(|_| JudgeError::SampleCount(sample_count))
}

/// Turn the raw replies of one call into a result
fn assemble_result(
    parser: &ResponseParser,
    pricing: &Pricing,
    replies: &[String],
    usage: TokenUsage,
    sample_count: u32,
    started: Instant,
) -> Result<EvaluationResult, JudgeError> {
    checked_sample_count(sample_count)?;
    if replies.len() < sample_count as usize {
        return Err(JudgeError::MissingChoices {
            expected: sample_count,
            received: replies.len(),
        });
    }

    let mut samples: Vec<Sample> = replies
        .iter()
        .take(sample_count as usize)
        .map(|reply| parser.parse(reply))
        .collect();

    let verdict = if sample_count > 1 {
        Verdict::Multi {
            samples,
            score: None,
        }
    } else {
        let sample = samples.remove(0);
        Verdict::Single {
            score: sample.score,
            reasoning: sample.reasoning,
        }
    };

    let cost = pricing.cost(&usage);
    let duration = started.elapsed().as_secs_f64();

    debug!(
        duration,
        cost,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "judge call finished"
    );

    Ok(EvaluationResult {
        verdict,
        usage,
        cost,
        duration,
        saved_cost: 0.0,
    })
}

/// Client-side spacing between requests
struct RateLimiter {
    rate_limit_rps: f64,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(rate_limit_rps: f64) -> Self {
        Self {
            rate_limit_rps,
            last_request: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.rate_limit_rps <= 0.0 {
            return;
        }

        let min_interval = Duration::from_secs_f64(1.0 / self.rate_limit_rps);
        let mut last_request = self.last_request.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }

        *last_request = Some(Instant::now());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{Backend, JudgeConfig, Turn};

    pub const RESULT_REGEX: &str = r"(.+) Score: ([0-9\.]+)\.?";

    pub fn judge_config(backend: Backend, api_endpoint: &str) -> JudgeConfig {
        JudgeConfig {
            model: match backend {
                Backend::Chat => "gpt-4".to_string(),
                Backend::Completion => "text-davinci-003".to_string(),
            },
            backend,
            api_endpoint: api_endpoint.to_string(),
            input_1k_token_cost: 0.03,
            output_1k_token_cost: 0.06,
            initial_prompt: "Rate how well the passage answers the question.".to_string(),
            query_passage_format: "Passage: \"{passage}\"\nQuestion: \"{query}\"".to_string(),
            result_regex: RESULT_REGEX.to_string(),
            examples: vec![vec![
                Turn {
                    role: "user".to_string(),
                    content: "Passage: \"Water boils at 100C.\"\nQuestion: \"boiling point?\""
                        .to_string(),
                },
                Turn {
                    role: "assistant".to_string(),
                    content: "Direct answer. Score: 3".to_string(),
                },
            ]],
            example_format: Some("Example {index}:\n{content}".to_string()),
            max_tokens: 500,
            rate_limit_rps: 0.0,
            request_timeout_secs: 5,
        }
    }

    pub fn usage_json(prompt: u32, completion: u32) -> String {
        format!(
            r#"{{"prompt_tokens": {}, "completion_tokens": {}, "total_tokens": {}}}"#,
            prompt,
            completion,
            prompt + completion
        )
    }
}
