//! Backend Invokers
//!
//! Abstracted access to remote model backends through one trait. The
//! dispatcher holds one invoker per backend kind and only consumes the
//! success/error classification.
//!
//! # Available Invokers
//!
//! - **Ollama**: chat API over HTTP (text and agentic routes)
//! - **Polling**: adapter for submit/status job APIs (video generation)
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::backend::{BackendInvoker, InvokeRequest, OllamaInvoker};
//! use switchboard_core::conversation::ChatMessage;
//!
//! let invoker = OllamaInvoker::from_env();
//! let request = InvokeRequest::new(2, "llama3", vec![ChatMessage::user("Hello!")]);
//! let reply = invoker.invoke(&request).await?;
//! ```

mod ollama;
mod polling;
mod traits;

pub use ollama::OllamaInvoker;
pub use polling::{JobBackend, JobStatus, PollingInvoker};
pub use traits::{BackendError, BackendInvoker, BackendReply, ErrorClass, InvokeRequest};
