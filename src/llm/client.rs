use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::ChatProvider;
use super::error::LlmError;
use super::types::{ChatMessage, ChatRequest, ChatResponse};
use crate::config::LlmConfig;

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay_ms: config.base_delay_ms,
            },
        })
    }

    /// Default settings against a custom base URL (useful for testing).
    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, LlmError> {
        let config = LlmConfig {
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            ..LlmConfig::default()
        };
        Self::from_config(&config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(self.retry.base_delay_ms);
            return Err(LlmError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<ChatResponse>().await?)
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut attempt = 0;
        loop {
            let err = match self.send_once(&req).await {
                Ok(resp) => {
                    if let Some(usage) = &resp.usage {
                        debug!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "chat completion"
                        );
                    }
                    return resp
                        .text()
                        .map(|t| t.trim().to_string())
                        .ok_or(LlmError::EmptyResponse);
                }
                Err(e) => e,
            };

            attempt += 1;
            if !err.is_retryable() || attempt > self.retry.max_retries {
                return Err(err);
            }

            let mut delay_ms = self.retry.delay_for_attempt(attempt);
            if let LlmError::RateLimited { retry_after_ms } = err {
                delay_ms = delay_ms.max(retry_after_ms);
            }
            warn!(
                attempt,
                max = self.retry.max_retries,
                delay_ms,
                error = %err,
                "retrying chat completion"
            );
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(text: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-test",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        })
    }

    fn fast_client(server: &MockServer) -> OpenAiClient {
        OpenAiClient::with_base_url("sk-test", &server.uri())
            .unwrap()
            .with_retry(RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
            })
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 2000,
        };
        assert_eq!(policy.delay_for_attempt(1), 2000);
        assert_eq!(policy.delay_for_attempt(2), 4000);
        assert_eq!(policy.delay_for_attempt(3), 8000);
    }

    #[tokio::test]
    async fn chat_returns_trimmed_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  bonjour \n")))
            .expect(1)
            .mount(&server)
            .await;

        let reply = fast_client(&server).chat("sys", "hello").await.unwrap();
        assert_eq!(reply, "bonjour");
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let reply = fast_client(&server).chat("sys", "hello").await.unwrap();
        assert_eq!(reply, "ok");
    }

    #[tokio::test]
    async fn huge_retry_after_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", u64::MAX.to_string()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(&server).with_retry(RetryPolicy {
            max_retries: 0,
            base_delay_ms: 1,
        });
        let err = client.chat("sys", "hello").await.unwrap_err();
        assert!(matches!(
            err,
            LlmError::RateLimited {
                retry_after_ms: u64::MAX
            }
        ));
    }

    #[tokio::test]
    async fn client_errors_fail_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = fast_client(&server).chat("sys", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError { status: 401, .. }));
    }

    #[tokio::test]
    async fn server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_client(&server).chat("sys", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError { status: 502, .. }));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "x", "choices": []})))
            .mount(&server)
            .await;

        let err = fast_client(&server).chat("sys", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }
}
