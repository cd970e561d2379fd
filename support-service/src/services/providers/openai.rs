//! OpenAI-compatible embedding and chat completion client.
//!
//! Works against any endpoint exposing `/embeddings` and `/chat/completions`
//! with bearer authentication. Every call goes through [`retry_call`].

use super::{
    Completion, CompletionProvider, CompletionRequest, EmbeddingProvider, FinishReason,
    ProviderError,
};
use crate::config::ProviderConfig;
use crate::services::metrics::{record_provider_error, record_provider_latency};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use service_core::utils::{retry_call, RetryConfig};
use std::time::{Duration, Instant};

const PROVIDER: &str = "openai";

pub struct OpenAiProvider {
    config: ProviderConfig,
    client: Client,
    retry: RetryConfig,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("AI_API_KEY is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        let retry = RetryConfig::with_max_retries(config.max_retries);

        Ok(Self {
            config,
            client,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited);
            }
            if status.is_server_error() {
                return Err(ProviderError::ServerError(status.as_u16(), error_text));
            }
            return Err(ProviderError::ApiError(format!(
                "{} returned {}: {}",
                path, status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))
    }

    fn observe<T>(operation: &str, started: Instant, result: &Result<T, ProviderError>) {
        record_provider_latency(PROVIDER, operation, started.elapsed().as_secs_f64());
        if let Err(e) = result {
            record_provider_error(PROVIDER, e.kind());
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidRequest(
                "Cannot embed empty text".to_string(),
            ));
        }

        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: text,
        };

        let request = &request;
        let started = Instant::now();
        let result = retry_call(&self.retry, "embed", || async move {
            let response: EmbeddingResponse = self.post("embeddings", request).await?;
            response
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| ProviderError::ApiError("Empty embedding response".to_string()))
        })
        .await;

        Self::observe("embed", started, &result);
        result
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = ChatCompletionRequest {
            model: request
                .model
                .as_deref()
                .unwrap_or(&self.config.completion_model),
            messages: request
                .messages
                .iter()
                .map(|t| ChatMessage {
                    role: t.role.as_str(),
                    content: &t.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        tracing::debug!(
            model = %body.model,
            turns = body.messages.len(),
            "Sending chat completion request"
        );

        let body = &body;
        let started = Instant::now();
        let result = retry_call(&self.retry, "complete", || async move {
            let response: ChatCompletionResponse = self.post("chat/completions", body).await?;
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError("No completion choices".to_string()))?;

            let finish_reason = match choice.finish_reason.as_deref() {
                Some("length") => FinishReason::Length,
                Some("content_filter") => FinishReason::ContentFilter,
                _ => FinishReason::Complete,
            };
            let usage = response.usage.unwrap_or_default();

            Ok(Completion {
                text: choice.message.content.unwrap_or_default(),
                finish_reason,
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
        })
        .await;

        Self::observe("complete", started, &result);
        result
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("AI_API_KEY is empty".to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: &str) -> ProviderConfig {
        ProviderConfig {
            api_base: "https://llm.internal/v1/".to_string(),
            api_key: api_key.to_string(),
            embedding_model: "embed".to_string(),
            embedding_dimensions: 8,
            completion_model: "chat".to_string(),
            max_tokens: 100,
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    #[test]
    fn missing_key_is_not_configured() {
        assert!(matches!(
            OpenAiProvider::new(config("")),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn urls_join_without_double_slash() {
        let provider = OpenAiProvider::new(config("k")).unwrap();
        assert_eq!(
            provider.url("chat/completions"),
            "https://llm.internal/v1/chat/completions"
        );
    }

    #[test]
    fn completion_response_parses_length_finish() {
        let raw = r#"{"choices":[{"message":{"content":"Hi"},"finish_reason":"length"}],
                      "usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 3);
    }
}
