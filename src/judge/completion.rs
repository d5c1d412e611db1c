use super::{
    Judge, Pricing, PromptTemplate, RateLimiter, ResponseParser, assemble_result,
    checked_sample_count, temperature_for,
};
use crate::config::JudgeConfig;
use crate::error::JudgeError;
use crate::models::{EvaluationResult, TokenUsage};
use async_openai::types::{CreateCompletionRequest, CreateCompletionRequestArgs, CreateCompletionResponse};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

/// Judge that sends one flattened prompt to a legacy completions endpoint
pub struct CompletionJudge {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u16,
    pricing: Pricing,
    prompt: PromptTemplate,
    parser: ResponseParser,
    limiter: RateLimiter,
}

impl CompletionJudge {
    pub fn new(client: Client<OpenAIConfig>, config: &JudgeConfig, parser: ResponseParser) -> Self {
        Self {
            client,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            pricing: Pricing::from_config(config),
            prompt: PromptTemplate::from_config(config),
            parser,
            limiter: RateLimiter::new(config.rate_limit_rps),
        }
    }

    /// Instruction, example turns and the pair, separated by blank lines.
    /// The instruction only points at examples when there are some.
    fn build_prompt(&self, query: &str, passage: &str) -> String {
        let mut prompt = if self.prompt.has_examples() {
            format!("{} Follow the examples below.", self.prompt.initial_prompt)
        } else {
            self.prompt.initial_prompt.clone()
        };

        for turn in self.prompt.example_turns() {
            prompt.push_str("\n\n");
            prompt.push_str(&turn.content);
        }

        prompt.push_str("\n\n");
        prompt.push_str(&self.prompt.query_passage(query, passage));
        prompt
    }

    fn build_request(
        &self,
        query: &str,
        passage: &str,
        sample_count: u32,
    ) -> Result<CreateCompletionRequest, JudgeError> {
        let n = checked_sample_count(sample_count)?;

        let request = CreateCompletionRequestArgs::default()
            .model(&self.model)
            .prompt(self.build_prompt(query, passage))
            .temperature(temperature_for(sample_count))
            .n(n)
            .max_tokens(self.max_tokens)
            .top_p(1.0)
            .frequency_penalty(0.0)
            .presence_penalty(0.0)
            .build()?;

        Ok(request)
    }

    fn extract_replies(response: &CreateCompletionResponse) -> Vec<String> {
        let mut choices: Vec<_> = response.choices.iter().collect();
        choices.sort_by_key(|choice| choice.index);

        choices.into_iter().map(|choice| choice.text.clone()).collect()
    }
}

#[async_trait]
impl Judge for CompletionJudge {
    async fn evaluate(
        &self,
        query: &str,
        passage: &str,
        sample_count: u32,
    ) -> Result<EvaluationResult, JudgeError> {
        let request = self.build_request(query, passage, sample_count)?;

        self.limiter.wait().await;
        let started = Instant::now();
        debug!(model = %self.model, sample_count, "sending completion request");

        let response = self.client.completions().create(request).await?;

        let usage = response.usage.as_ref().ok_or(JudgeError::MissingUsage)?;
        let usage = TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        };
        let replies = Self::extract_replies(&response);

        assemble_result(&self.parser, &self.pricing, &replies, usage, sample_count, started)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
