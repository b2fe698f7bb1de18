use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::stream::{CompletionResult, LineBuffer, LineOutcome};
use crate::config::{ApiConfig, GenerationConfig};
use crate::error::GenerationError;
use crate::util::truncate;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Sanitize API response content for error messages to prevent credential leakage.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "nvapi-",
        "sk-",
    ];

    let truncated = truncate(content.trim(), MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return "(response details redacted - may contain sensitive data)".to_string();
    }
    truncated
}

/// Per-call knobs for [`StreamingCompletionClient::complete`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    /// Total attempts, including the first.
    pub retries: u32,
    pub temperature: f32,
}

impl From<&GenerationConfig> for CompletionOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            retries: config.retries,
            temperature: config.temperature,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// Linear backoff: the sleep after failed attempt `n` is `n * unit`.
pub(crate) fn backoff_delay(unit_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(unit_secs.saturating_mul(u64::from(attempt)))
}

/// Issues streamed chat-completion requests and reassembles the text.
pub struct StreamingCompletionClient {
    http: reqwest::Client,
    config: ApiConfig,
    endpoint: String,
}

impl StreamingCompletionClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        // No client-wide timeout: a healthy stream can run for many minutes. The per-attempt
        // ceiling is enforced around the whole request in `attempt`.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    /// Request a completion, retrying any failure with linear backoff.
    ///
    /// Attempts run strictly one after another. Once every attempt has failed the last
    /// error is returned wrapped in [`GenerationError::Exhausted`].
    pub async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, GenerationError> {
        let attempts = options.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            info!(attempt, attempts, model = %self.config.model, "requesting streamed completion");
            match self.attempt(prompt, options).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(attempt, kind = err.kind(), error = %err, "completion attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(self.config.backoff_secs, attempt)).await;
                    }
                }
            }
        }

        Err(GenerationError::Exhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(GenerationError::EmptyResponse)),
        })
    }

    async fn attempt(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, GenerationError> {
        let secs = self.config.request_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), self.stream_once(prompt, options))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout { secs }),
        }
    }

    async fn stream_once(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream: true,
        };

        let mut builder = self
            .http
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(key) = self.config.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: sanitize_api_response(&text),
            });
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut result = CompletionResult::default();
        let mut done = false;

        'read: while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            for line in lines.push(&bytes) {
                if result.feed_line(&line)? == LineOutcome::Done {
                    done = true;
                    break 'read;
                }
            }
        }
        if !done {
            if let Some(tail) = lines.finish() {
                result.feed_line(&tail)?;
            }
        }

        info!(
            chunks = result.chunks,
            content_chars = result.content.len(),
            reasoning_chars = result.reasoning_content.len(),
            "stream finished"
        );
        if result.content.is_empty() && !result.reasoning_content.is_empty() {
            debug!("no content deltas; falling back to reasoning text");
        }
        result.finish()
    }
}
