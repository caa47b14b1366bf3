//! Inference dependency abstraction.
//!
//! The agent's decision steps call an external inference service. This
//! module defines what the runtime needs from it: a named dependency with
//! a single asynchronous `invoke`. Transient and permanent errors are both
//! breaker-recordable failures; the distinction is kept for logging and for
//! implementations that retry internally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors from an inference dependency.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl InferenceError {
    /// Whether the same request might succeed later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, InferenceError::Permanent(_))
    }
}

/// A chat message for an inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request to an inference dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic)
    pub temperature: f32,
}

/// Response from an inference dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Generated content
    pub content: String,

    /// Model that produced it
    pub model: String,
}

/// An external inference service.
///
/// `name()` is the dependency name its circuit breaker is keyed by
/// (e.g. "inference-chat", "inference-embed").
#[async_trait]
pub trait InferenceDependency: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}
