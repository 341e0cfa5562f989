//! Backend Invoker Traits
//!
//! Trait definitions for backend invokers. One invoker exists per backend kind
//! (text, image, audio, video, embedding, agentic); the dispatcher treats each
//! one opaquely and only consumes the success/error classification.
//!
//! # Error Taxonomy
//!
//! Every invoker failure is a [`BackendError`] that classifies itself:
//!
//! - **Transient**: rate limit, temporary unavailability, connectivity, timeout.
//!   Retried with backoff, then eligible for fallback.
//! - **Fatal**: malformed request, authentication failure, unknown model.
//!   Never retried.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::conversation::{ChatMessage, ToolCall};
use crate::credentials::Credential;
use crate::options::ToolSpec;

/// Retry classification of a backend failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable
    Transient,
    /// Not retryable
    Fatal,
}

/// Errors returned by a backend invoker
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BackendError {
    /// Rate limited by the backend
    #[error("rate limited{}", .retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited {
        /// Server-provided minimum delay
        retry_after_ms: Option<u64>,
    },

    /// Backend temporarily unavailable (overloaded, 5xx)
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Connection or DNS failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// Call exceeded its deadline
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Request rejected as malformed
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Credential rejected
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Model not known to the backend
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Invoker failed in an unexpected way (including panics)
    #[error("invoker failure: {0}")]
    Internal(String),
}

impl BackendError {
    /// Retry classification
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. }
            | Self::Unavailable(_)
            | Self::Connection(_)
            | Self::Timeout(_) => ErrorClass::Transient,
            Self::MalformedRequest(_)
            | Self::AuthFailed(_)
            | Self::UnknownModel(_)
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the error is retryable
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the credential itself was rejected
    #[must_use]
    pub fn implicates_credential(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }

    /// Server-provided minimum retry delay
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Map an HTTP status code onto the taxonomy
    #[must_use]
    pub fn from_status(status: u16, body: &str, retry_after_ms: Option<u64>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after_ms },
            401 | 403 => Self::AuthFailed(format!("HTTP {status}: {body}")),
            404 => Self::UnknownModel(format!("HTTP {status}: {body}")),
            408 => Self::Timeout(Duration::ZERO),
            400..=499 => Self::MalformedRequest(format!("HTTP {status}: {body}")),
            _ => Self::Unavailable(format!("HTTP {status}: {body}")),
        }
    }
}

/// A fully assembled request for one backend call
#[derive(Clone, Debug)]
pub struct InvokeRequest {
    /// Route the call belongs to
    pub route_id: u32,
    /// Backend-specific model identifier
    pub model: String,
    /// Messages to send
    pub messages: Vec<ChatMessage>,
    /// Tools offered to the model
    pub tools: Vec<ToolSpec>,
    /// Whether the model may request tools on this call
    pub tools_enabled: bool,
    /// Structured-output schema
    pub schema: Option<Value>,
    /// Attached file references
    pub files: Vec<String>,
    /// Maximum tokens to generate (0 = backend default)
    pub max_tokens: u32,
    /// Credential selected for this attempt
    pub credential: Option<Credential>,
}

impl InvokeRequest {
    /// Create a request for a model with a message list
    pub fn new(route_id: u32, model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            route_id,
            model: model.into(),
            messages,
            tools: Vec::new(),
            tools_enabled: false,
            schema: None,
            files: Vec::new(),
            max_tokens: 0,
            credential: None,
        }
    }

    /// Offer tools
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools_enabled = !tools.is_empty();
        self.tools = tools;
        self
    }

    /// The last user message, if any
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::conversation::MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Raw result of a successful backend call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendReply {
    /// Response text
    pub text: String,
    /// Tool executions requested by the model
    pub tool_calls: Vec<ToolCall>,
    /// Tokens used (if reported)
    pub tokens_used: Option<u32>,
}

impl BackendReply {
    /// Plain text reply
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Reply requesting tool executions
    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            tokens_used: None,
        }
    }

    /// A reply with neither text nor tool calls
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Backend invoker
///
/// Implement this trait to connect a backend kind. Implementations handle
/// provider-specific details (API formats, auth, polling) and must classify
/// every failure as a [`BackendError`].
#[async_trait]
pub trait BackendInvoker: Send + Sync {
    /// Invoker name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Perform one remote call
    async fn invoke(&self, request: &InvokeRequest) -> Result<BackendReply, BackendError>;
}
