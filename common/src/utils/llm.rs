use std::sync::Arc;
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use tracing::debug;

use crate::{
    error::AppError,
    utils::{
        config::{AppConfig, LlmBackend},
        text::approx_token_count,
    },
};

/// Outcome of a completion call, with token usage for governor reconciliation.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Chat-completion provider with bounded sampling parameters.
///
/// The static backend returns a canned answer for tests; the disabled
/// backend fails with `LLMFailure`, which the query pipeline turns into a
/// deterministic degraded response.
pub struct LlmProvider {
    backend: Backend,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    request_timeout: Duration,
}

enum Backend {
    OpenAi(Arc<Client<OpenAIConfig>>),
    Static(String),
    Disabled,
}

impl LlmProvider {
    pub fn from_config(
        config: &AppConfig,
        client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let settings = &config.llm;
        let backend = match settings.backend {
            LlmBackend::OpenAi => {
                let client = client.ok_or_else(|| {
                    AppError::Validation("openai llm backend requires a configured client".into())
                })?;
                Backend::OpenAi(client)
            }
            LlmBackend::Static => Backend::Static(
                settings
                    .static_answer
                    .clone()
                    .unwrap_or_else(|| "This is a canned answer.".to_string()),
            ),
            LlmBackend::Disabled => Backend::Disabled,
        };

        Ok(Self {
            backend,
            model: settings.model.clone(),
            // Grounded answering wants near-greedy decoding.
            temperature: settings.temperature.clamp(0.0, 0.5),
            max_output_tokens: settings.max_output_tokens,
            request_timeout: Duration::from_secs(settings.request_timeout_secs.max(1)),
        })
    }

    pub fn new_static(answer: impl Into<String>) -> Self {
        Self {
            backend: Backend::Static(answer.into()),
            model: "static".to_string(),
            temperature: 0.0,
            max_output_tokens: 700,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn new_disabled() -> Self {
        Self {
            backend: Backend::Disabled,
            model: "disabled".to_string(),
            temperature: 0.0,
            max_output_tokens: 700,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            Backend::OpenAi(_) => "openai",
            Backend::Static(_) => "static",
            Backend::Disabled => "disabled",
        }
    }

    pub fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }

    /// Runs one completion under the request timeout. Timeouts surface as
    /// `DeadlineExceeded`, provider errors as `LLMFailure`.
    pub async fn complete(&self, system: &str, user: &str) -> Result<CompletionOutput, AppError> {
        match &self.backend {
            Backend::OpenAi(client) => {
                let request = CreateChatCompletionRequestArgs::default()
                    .model(&self.model)
                    .temperature(self.temperature)
                    .max_tokens(self.max_output_tokens)
                    .messages([
                        ChatCompletionRequestSystemMessage::from(system).into(),
                        ChatCompletionRequestUserMessage::from(user).into(),
                    ])
                    .build()?;

                let response =
                    tokio::time::timeout(self.request_timeout, client.chat().create(request))
                        .await
                        .map_err(|_| AppError::DeadlineExceeded)?
                        .map_err(|e| AppError::LLMFailure(e.to_string()))?;

                let text = response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .ok_or_else(|| {
                        AppError::LLMFailure("no content in completion response".into())
                    })?;

                let (tokens_in, tokens_out) = response
                    .usage
                    .map(|usage| {
                        (
                            u64::from(usage.prompt_tokens),
                            u64::from(usage.completion_tokens),
                        )
                    })
                    .unwrap_or_else(|| {
                        (
                            approx_token_count(system) + approx_token_count(user),
                            approx_token_count(&text),
                        )
                    });

                debug!(tokens_in, tokens_out, "completion finished");

                Ok(CompletionOutput {
                    text,
                    tokens_in,
                    tokens_out,
                })
            }
            Backend::Static(answer) => Ok(CompletionOutput {
                text: answer.clone(),
                tokens_in: approx_token_count(system) + approx_token_count(user),
                tokens_out: approx_token_count(answer),
            }),
            Backend::Disabled => Err(AppError::LLMFailure("llm backend disabled".into())),
        }
    }
}
