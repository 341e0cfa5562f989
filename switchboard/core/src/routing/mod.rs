//! Routing Layer
//!
//! Decides which backend serves a numbered route and keeps calls alive when
//! backends misbehave.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     RouteDispatcher                        │
//! │  ┌────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │ RouteTable │  │ResponseCache │  │   FallbackGraph    │  │
//! │  │ (config)   │  │ (TTL, bound) │  │ (one hop per call) │  │
//! │  └────────────┘  └──────────────┘  └────────────────────┘  │
//! │                 ┌────────────────────┐                     │
//! │                 │  RetryController   │──> CredentialSource │
//! │                 └─────────┬──────────┘                     │
//! └───────────────────────────┼────────────────────────────────┘
//!                             v
//!                    BackendInvoker (per kind)
//! ```

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod fallback;
pub mod metrics;
pub mod retry;

pub use cache::{CacheEntry, CacheKey, ResponseCache};
pub use config::{
    BackendKind, DispatchConfig, RetryConfig, Route, RouteTable, RouteTableError,
};
pub use dispatcher::{BuildError, RouteDispatcher, RouteDispatcherBuilder};
pub use fallback::{CallContext, FallbackGraph, FallbackGraphError};
pub use metrics::{Counter, DispatchMetrics, MetricsSnapshot};
pub use retry::{adjust_for_rate_limit, RetryController, RetryOutcome};
