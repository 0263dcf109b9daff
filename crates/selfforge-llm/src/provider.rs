//! LLM provider trait
//!
//! The provider is a request/response oracle: structured chat request in,
//! text out. Streaming is intentionally absent from this contract.

use tokio_util::sync::CancellationToken;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// Transport-level faults are worth retrying; auth failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_) | Self::RateLimited { .. } | Self::NetworkError(_)
        )
    }
}

/// A single completion request.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            system: None,
            prompt: String::new(),
            temperature: 0.3,
            max_tokens: 2000,
        }
    }
}

/// LLM Provider trait
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Complete a request and return the response text. If `cancel` is
    /// triggered, the in-flight HTTP request is dropped and the call
    /// returns `LlmError::Cancelled`.
    async fn complete(
        &self,
        request: ChatRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<String>;
}
