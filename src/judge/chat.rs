use super::{
    Judge, Pricing, PromptTemplate, RateLimiter, ResponseParser, assemble_result,
    checked_sample_count, temperature_for,
};
use crate::config::JudgeConfig;
use crate::error::JudgeError;
use crate::models::{EvaluationResult, TokenUsage};
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

/// Judge that talks to a chat-completions endpoint
pub struct ChatJudge {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u16,
    pricing: Pricing,
    prompt: PromptTemplate,
    parser: ResponseParser,
    limiter: RateLimiter,
}

impl ChatJudge {
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

    /// System instruction, then the worked examples, then the pair itself
    fn build_messages(
        &self,
        query: &str,
        passage: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = vec![system_message(&self.prompt.initial_prompt)?];

        for turn in self.prompt.example_turns() {
            let message = match turn.role.as_str() {
                "user" => user_message(&turn.content)?,
                "system" => system_message(&turn.content)?,
                _ => assistant_message(&turn.content)?,
            };
            messages.push(message);
        }

        messages.push(user_message(&self.prompt.query_passage(query, passage))?);
        Ok(messages)
    }

    fn build_request(
        &self,
        query: &str,
        passage: &str,
        sample_count: u32,
    ) -> Result<CreateChatCompletionRequest, JudgeError> {
        let n = checked_sample_count(sample_count)?;
        let messages = self.build_messages(query, passage)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(temperature_for(sample_count))
            .n(n)
            .max_tokens(self.max_tokens)
            .build()?;

        Ok(request)
    }

    /// Reply text of every choice, in choice order
    fn extract_replies(response: &CreateChatCompletionResponse) -> Vec<String> {
        let mut choices: Vec<_> = response.choices.iter().collect();
        choices.sort_by_key(|choice| choice.index);

        choices
            .into_iter()
            .map(|choice| choice.message.content.clone().unwrap_or_default())
            .collect()
    }
}

fn system_message(content: &str) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(content.to_string())
        .build()?
        .into())
}

fn user_message(content: &str) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(content.to_string())
        .build()?
        .into())
}

fn assistant_message(content: &str) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(ChatCompletionRequestAssistantMessageArgs::default()
        .content(content.to_string())
        .build()?
        .into())
}

#[async_trait]
impl Judge for ChatJudge {
    async fn evaluate(
        &self,
        query: &str,
        passage: &str,
        sample_count: u32,
    ) -> Result<EvaluationResult, JudgeError> {
        let request = self.build_request(query, passage, sample_count)?;

        self.limiter.wait().await;
        let started = Instant::now();
        debug!(model = %self.model, sample_count, "sending chat completion request");

        let response = self.client.chat().create(request).await?;

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
