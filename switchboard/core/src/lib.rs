//! Switchboard Core - Route Dispatch for Heterogeneous LLM Backends
//!
//! Callers send a payload to a numbered route; the dispatcher resolves the
//! route to a backend kind and model, serves cached responses, retries
//! transient failures with linear backoff, rotates and quarantines
//! credentials, falls back to an alternate route at most once per call, and
//! runs a bounded tool loop for agentic routes.
//!
//! # Architecture
//!
//! ```text
//! caller ──dispatch(route, payload, options)──> RouteDispatcher
//!                                                   │
//!          ┌──────────────┬──────────────┬──────────┴─────────┬──────────────┐
//!          v              v              v                    v              v
//!     RouteTable    ResponseCache   RetryController     FallbackGraph   agent::*
//!                                        │                              (tool loop,
//!                                        v                               compressor)
//!                              BackendInvoker (per kind)
//!                              CredentialSource
//! ```
//!
//! # Key Types
//!
//! - [`RouteDispatcher`]: the caller-facing façade; never raises
//! - [`BackendInvoker`]: one network call to one backend kind
//! - [`CredentialSource`]: active credential, quarantine and rotation
//! - [`UsageLogger`]: accounting sink for successful calls
//! - [`DispatchOptions`]: typed per-call options
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{BackendKind, DispatchOptions, OllamaInvoker, Route, RouteDispatcher};
//!
//! let dispatcher = RouteDispatcher::builder()
//!     .with_invoker(BackendKind::Text, Arc::new(OllamaInvoker::from_env()))
//!     .with_route(Route::new(1, BackendKind::Text, "llama3.2"))
//!     .with_route(Route::new(2, BackendKind::Text, "qwen2.5"))
//!     .with_fallback(1, 2)
//!     .build()?;
//!
//! let answer = dispatcher
//!     .dispatch(1, "Name three rivers", DispatchOptions::from_source("docs"))
//!     .await;
//! if switchboard_core::is_error_response(&answer) {
//!     eprintln!("dispatch failed: {answer}");
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`routing`]: route table, dispatcher, retry, fallback, cache, metrics
//! - [`backend`]: invoker interface, Ollama HTTP invoker, polling adapter
//! - [`agent`]: agentic tool loop and conversation compressor
//! - [`credentials`]: credential source interface and pool
//! - [`config`]: TOML configuration with environment overrides
//! - [`usage`]: usage records and loggers
//! - [`blocking`]: bounded pool for blocking work

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod backend;
pub mod blocking;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod options;
pub mod routing;
pub mod test_utils;
pub mod usage;

// Dispatcher exports
pub use routing::{
    BackendKind, DispatchConfig, DispatchMetrics, FallbackGraph, MetricsSnapshot, ResponseCache,
    RetryConfig, Route, RouteDispatcher, RouteDispatcherBuilder, RouteTable,
};

// Backend exports
pub use backend::{
    BackendError, BackendInvoker, BackendReply, ErrorClass, InvokeRequest, OllamaInvoker,
    PollingInvoker,
};

// Agentic exports
pub use agent::{
    AgenticToolLoop, CapabilityExecutor, ConversationCompressor, Summarizer, ToolLoopConfig,
};

// Shared types
pub use conversation::{ChatMessage, MessageRole, ToolCall};
pub use credentials::{Credential, CredentialError, CredentialPool, CredentialSource};
pub use error::{error_kind_of, is_error_response, DispatchError, ErrorKind};
pub use options::{DispatchOptions, ToolSpec};
pub use usage::{TracingUsageLogger, UsageLogger, UsageRecord};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, SwitchboardConfig, SwitchboardToml,
};
