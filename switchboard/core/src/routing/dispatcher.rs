//! Route Dispatcher
//!
//! The caller-facing façade. One instance is built at startup and shared by
//! reference; it owns the route table, invokers, fallback graph, cache, retry
//! controller and agentic machinery.
//!
//! # Flow
//!
//! ```text
//! dispatch(route, payload, options)
//!     |
//!     +-- unknown route ------------------------> UnknownRoute (no backend call)
//!     +-- disabled route -> default route (logged)
//!     |
//!     v
//! cache hit? --yes--> cached response
//!     | no
//!     v
//! [agentic: compress history] -> RetryController -> [agentic: tool loop]
//!     |
//!     +-- success (non-empty) -> cache write + usage record -> response
//!     +-- empty --------------> NullResponse
//!     +-- fatal --------------> Fatal
//!     +-- exhausted ----------> fallback hop (once) or Exhausted / AllRoutesFailed
//! ```
//!
//! `dispatch` always returns a string; failures are encoded with the error
//! marker. `dispatch_result` returns the typed result.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use thiserror::Error;

use super::cache::{CacheKey, ResponseCache};
use super::config::{BackendKind, DispatchConfig, RetryConfig, Route, RouteTable, RouteTableError};
use super::fallback::{CallContext, FallbackGraph, FallbackGraphError};
use super::metrics::DispatchMetrics;
use super::retry::{RetryController, RetryOutcome};
use crate::agent::{
    AgenticToolLoop, CapabilityExecutor, ConversationCompressor, NoTools, SummarizeError,
    Summarizer, ToolLoopConfig, TurnSender,
};
use crate::backend::{BackendError, BackendInvoker, BackendReply, InvokeRequest};
use crate::conversation::ChatMessage;
use crate::credentials::{CredentialError, CredentialPool, CredentialSource};
use crate::error::DispatchError;
use crate::options::DispatchOptions;
use crate::usage::{record_quietly, TracingUsageLogger, UsageLogger, UsageRecord};

/// System prompt for history summarisation calls
const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the following conversation in a few sentences. \
     Keep names, decisions, open questions and any facts the assistant will need later.";

/// Caller label used for summarisation calls
const COMPRESSOR_SOURCE: &str = "conversation-compressor";

// ============================================================================
// Route Failure
// ============================================================================

/// How serving one route failed
#[derive(Debug)]
enum RouteFailure {
    Fatal(BackendError),
    Exhausted { attempts: u32, last: BackendError },
    Credential(CredentialError),
    Null,
}

impl From<CredentialError> for RouteFailure {
    fn from(e: CredentialError) -> Self {
        Self::Credential(e)
    }
}

/// Successful outcome of serving one route
struct Served {
    reply: BackendReply,
    attempts: u32,
}

fn settle(outcome: RetryOutcome) -> Result<Served, RouteFailure> {
    match outcome {
        RetryOutcome::Success { reply, attempts } => Ok(Served { reply, attempts }),
        RetryOutcome::Fatal { error, .. } => Err(RouteFailure::Fatal(error)),
        RetryOutcome::Exhausted { attempts, last } => {
            Err(RouteFailure::Exhausted { attempts, last })
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Errors assembling a dispatcher
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    /// Duplicate route id
    #[error(transparent)]
    RouteTable(#[from] RouteTableError),

    /// Invalid fallback edge
    #[error(transparent)]
    Fallback(#[from] FallbackGraphError),

    /// Fallback edge to an unregistered route
    #[error("route {from} falls back to unregistered route {to}")]
    UnknownFallbackTarget {
        /// Source route
        from: u32,
        /// Missing target
        to: u32,
    },

    /// Fallback edge from an unregistered route
    #[error("fallback edge from unregistered route {0}")]
    UnknownFallbackSource(u32),

    /// Default route not registered
    #[error("default route {0} is not registered")]
    UnknownDefaultRoute(u32),

    /// Summary route not registered
    #[error("summary route {0} is not registered")]
    UnknownSummaryRoute(u32),

    /// Summary route would recurse into compression
    #[error("summary route {0} must not be agentic")]
    AgenticSummaryRoute(u32),

    /// A route whose backend kind has no invoker
    #[error("route {route} needs a {kind} invoker")]
    MissingInvoker {
        /// Route id
        route: u32,
        /// Backend kind
        kind: BackendKind,
    },
}

/// Builder for [`RouteDispatcher`]
pub struct RouteDispatcherBuilder {
    routes: Vec<Route>,
    edges: Vec<(u32, u32)>,
    invokers: HashMap<BackendKind, Arc<dyn BackendInvoker>>,
    dispatch: DispatchConfig,
    retry: RetryConfig,
    credentials: Arc<dyn CredentialSource>,
    usage: Arc<dyn UsageLogger>,
    executor: Arc<dyn CapabilityExecutor>,
    tool_loop: ToolLoopConfig,
    compressor: Option<(ConversationCompressor, u32)>,
}

impl Default for RouteDispatcherBuilder {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            edges: Vec::new(),
            invokers: HashMap::new(),
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            credentials: Arc::new(CredentialPool::empty()),
            usage: Arc::new(TracingUsageLogger),
            executor: Arc::new(NoTools),
            tool_loop: ToolLoopConfig::default(),
            compressor: None,
        }
    }
}

impl RouteDispatcherBuilder {
    /// Register a route
    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Add a fallback edge
    #[must_use]
    pub fn with_fallback(mut self, from: u32, to: u32) -> Self {
        self.edges.push((from, to));
        self
    }

    /// Set the invoker for a backend kind
    #[must_use]
    pub fn with_invoker(mut self, kind: BackendKind, invoker: Arc<dyn BackendInvoker>) -> Self {
        self.invokers.insert(kind, invoker);
        self
    }

    /// Dispatcher-wide settings
    #[must_use]
    pub fn with_dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    /// Retry policy
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Credential source
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Usage sink
    #[must_use]
    pub fn with_usage_logger(mut self, usage: Arc<dyn UsageLogger>) -> Self {
        self.usage = usage;
        self
    }

    /// Tool runner for the agentic route
    #[must_use]
    pub fn with_capability_executor(mut self, executor: Arc<dyn CapabilityExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Agentic loop limits
    #[must_use]
    pub fn with_tool_loop_config(mut self, config: ToolLoopConfig) -> Self {
        self.tool_loop = config;
        self
    }

    /// Enable history compression, summarising through `summary_route`
    #[must_use]
    pub fn with_compressor(mut self, compressor: ConversationCompressor, summary_route: u32) -> Self {
        self.compressor = Some((compressor, summary_route));
        self
    }

    /// Validate and assemble the dispatcher
    pub fn build(self) -> Result<RouteDispatcher, BuildError> {
        let mut routes = RouteTable::new();
        for route in self.routes {
            if !self.invokers.contains_key(&route.kind) {
                return Err(BuildError::MissingInvoker {
                    route: route.id,
                    kind: route.kind,
                });
            }
            routes.register(route)?;
        }

        let mut fallback = FallbackGraph::new();
        for (from, to) in self.edges {
            if !routes.contains(from) {
                return Err(BuildError::UnknownFallbackSource(from));
            }
            if !routes.contains(to) {
                return Err(BuildError::UnknownFallbackTarget { from, to });
            }
            fallback.add_edge(from, to)?;
        }

        if let Some(default) = self.dispatch.default_route {
            if !routes.contains(default) {
                return Err(BuildError::UnknownDefaultRoute(default));
            }
        }

        let (compressor, summary_route) = match self.compressor {
            Some((compressor, summary_route)) => {
                let route = routes
                    .get(summary_route)
                    .ok_or(BuildError::UnknownSummaryRoute(summary_route))?;
                if route.kind == BackendKind::Agentic {
                    return Err(BuildError::AgenticSummaryRoute(summary_route));
                }
                (Some(compressor), Some(summary_route))
            }
            None => (None, None),
        };

        let metrics = Arc::new(DispatchMetrics::new());
        let disabled: HashSet<u32> = self.dispatch.disabled_routes.iter().copied().collect();

        tracing::info!(
            routes = routes.len(),
            fallback_edges = fallback.len(),
            disabled = disabled.len(),
            "Route dispatcher ready"
        );

        Ok(RouteDispatcher {
            cache: ResponseCache::new(self.dispatch.cache_ttl, self.dispatch.cache_max_entries),
            retry: RetryController::new(self.retry, self.credentials, Arc::clone(&metrics)),
            routes,
            invokers: self.invokers,
            fallback,
            default_route: self.dispatch.default_route,
            disabled: RwLock::new(disabled),
            metrics,
            usage: self.usage,
            executor: self.executor,
            tool_loop: AgenticToolLoop::new(self.tool_loop),
            compressor,
            summary_route,
        })
    }
}

// ============================================================================
// Route Dispatcher
// ============================================================================

/// Routes requests to backends with caching, retry and one-hop fallback
pub struct RouteDispatcher {
    routes: RouteTable,
    invokers: HashMap<BackendKind, Arc<dyn BackendInvoker>>,
    fallback: FallbackGraph,
    default_route: Option<u32>,
    disabled: RwLock<HashSet<u32>>,
    cache: ResponseCache,
    retry: RetryController,
    metrics: Arc<DispatchMetrics>,
    usage: Arc<dyn UsageLogger>,
    executor: Arc<dyn CapabilityExecutor>,
    tool_loop: AgenticToolLoop,
    compressor: Option<ConversationCompressor>,
    summary_route: Option<u32>,
}

impl RouteDispatcher {
    /// Start building a dispatcher
    #[must_use]
    pub fn builder() -> RouteDispatcherBuilder {
        RouteDispatcherBuilder::default()
    }

    /// Dispatch a payload; failures come back as error-marked strings
    pub async fn dispatch(&self, route_id: u32, payload: &str, options: DispatchOptions) -> String {
        match self.dispatch_result(route_id, payload, options).await {
            Ok(response) => response,
            Err(e) => e.to_marked_string(),
        }
    }

    /// Dispatch a payload, returning a typed result
    pub async fn dispatch_result(
        &self,
        route_id: u32,
        payload: &str,
        options: DispatchOptions,
    ) -> Result<String, DispatchError> {
        self.metrics.dispatches.inc();
        let mut ctx = CallContext::new(route_id, payload, options);

        let result = match AssertUnwindSafe(self.dispatch_ctx(&mut ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Fatal {
                route: ctx.route_id,
                source: BackendError::Internal("dispatch panicked".to_string()),
            }),
        };

        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
            tracing::error!(
                call_id = %ctx.call_id,
                route = ctx.original_route,
                source = %ctx.source(),
                kind = %e.kind(),
                error = %e,
                "Dispatch failed"
            );
        }
        result
    }

    async fn dispatch_ctx(&self, ctx: &mut CallContext) -> Result<String, DispatchError> {
        let mut route = self.resolve(ctx.route_id)?;
        ctx.route_id = route.id;

        loop {
            let failure = match self.serve(&route, ctx).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let (attempts, last) = match failure {
                RouteFailure::Exhausted { attempts, last } => (attempts, last),
                RouteFailure::Fatal(source) => {
                    return Err(DispatchError::Fatal {
                        route: route.id,
                        source,
                    })
                }
                RouteFailure::Credential(e) => return Err(DispatchError::Credential(e)),
                RouteFailure::Null => return Err(DispatchError::NullResponse(route.id)),
            };

            if ctx.fallback_attempted {
                tracing::warn!(
                    call_id = %ctx.call_id,
                    route = route.id,
                    original = ctx.original_route,
                    "Fallback route exhausted, not rerouting again"
                );
                return Err(DispatchError::AllRoutesFailed {
                    original: ctx.original_route,
                    fallback: route.id,
                    last,
                });
            }

            let Some(target) = self.fallback.next(route.id) else {
                return Err(DispatchError::Exhausted {
                    route: route.id,
                    attempts,
                    last,
                });
            };

            ctx.take_fallback(target);
            self.metrics.fallbacks.inc();
            tracing::info!(
                call_id = %ctx.call_id,
                from = route.id,
                to = target,
                attempts,
                error = %last,
                "Route exhausted, falling back"
            );
            let resolved = self.resolve(target)?;
            if resolved.id == route.id {
                tracing::warn!(
                    call_id = %ctx.call_id,
                    route = route.id,
                    fallback = target,
                    "Fallback resolves back to the exhausted route, aborting"
                );
                return Err(DispatchError::AllRoutesFailed {
                    original: ctx.original_route,
                    fallback: target,
                    last,
                });
            }
            route = resolved;
            ctx.route_id = route.id;
        }
    }

    /// Look up a route, substituting the default route for disabled ones
    fn resolve(&self, route_id: u32) -> Result<Arc<Route>, DispatchError> {
        let route = self
            .routes
            .get(route_id)
            .ok_or(DispatchError::UnknownRoute(route_id))?;
        if !self.is_disabled(route_id) {
            return Ok(route);
        }

        match self.default_route {
            Some(default) if default != route_id && !self.is_disabled(default) => {
                tracing::info!(route = route_id, substitute = default, "Route disabled, using default route");
                self.routes
                    .get(default)
                    .ok_or(DispatchError::RouteDisabled(route_id))
            }
            _ => Err(DispatchError::RouteDisabled(route_id)),
        }
    }

    async fn serve(&self, route: &Route, ctx: &CallContext) -> Result<String, RouteFailure> {
        let key = (route.is_cacheable() && ctx.options.use_cache).then(|| {
            CacheKey::new(route.id, &ctx.payload, &ctx.options.cache_fingerprint())
        });

        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                self.metrics.cache_hits.inc();
                tracing::debug!(call_id = %ctx.call_id, route = route.id, "Cache hit");
                return Ok(hit);
            }
            self.metrics.cache_misses.inc();
            tracing::debug!(call_id = %ctx.call_id, route = route.id, "Cache miss");
        }

        let Some(invoker) = self.invokers.get(&route.kind) else {
            return Err(RouteFailure::Fatal(BackendError::Internal(format!(
                "no invoker for {} routes",
                route.kind
            ))));
        };

        let (text, tokens_used, attempts) = if route.kind == BackendKind::Agentic {
            self.serve_agentic(route, invoker.as_ref(), ctx).await?
        } else {
            let served = self.serve_plain(route, invoker.as_ref(), ctx).await?;
            (served.reply.text, served.reply.tokens_used, served.attempts)
        };

        if text.trim().is_empty() {
            tracing::warn!(call_id = %ctx.call_id, route = route.id, "Backend returned empty response");
            return Err(RouteFailure::Null);
        }

        if let Some(key) = key {
            self.cache.put(key, text.clone());
        }

        let record = UsageRecord::new(
            ctx.call_id,
            route,
            ctx.original_route,
            &ctx.payload,
            &text,
            tokens_used,
            ctx.source(),
            attempts,
        );
        record_quietly(self.usage.as_ref(), &record);

        Ok(text)
    }

    fn request_for(&self, route: &Route, ctx: &CallContext, messages: Vec<ChatMessage>) -> InvokeRequest {
        let mut request = InvokeRequest::new(route.id, route.model.clone(), messages);
        request.schema = ctx.options.schema.clone();
        request.files = ctx.options.files.clone();
        request.max_tokens = ctx.options.max_tokens;
        request
    }

    async fn serve_plain(
        &self,
        route: &Route,
        invoker: &dyn BackendInvoker,
        ctx: &CallContext,
    ) -> Result<Served, RouteFailure> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &ctx.options.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(ctx.payload.trim()));

        let request = self.request_for(route, ctx, messages);
        let outcome = self
            .retry
            .run(route, invoker, request, ctx.options.timeout)
            .await?;
        settle(outcome)
    }

    async fn serve_agentic(
        &self,
        route: &Route,
        invoker: &dyn BackendInvoker,
        ctx: &CallContext,
    ) -> Result<(String, Option<u32>, u32), RouteFailure> {
        let history = match (&self.compressor, self.summary_route) {
            (Some(compressor), Some(summary_route)) => {
                let summarizer = RouteSummarizer {
                    dispatcher: self,
                    route_id: summary_route,
                };
                compressor
                    .prepare_history(ctx.options.history.clone(), &summarizer)
                    .await
            }
            _ => ctx.options.history.clone(),
        };

        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(system) = &ctx.options.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(history);
        messages.push(ChatMessage::user(ctx.payload.trim()));

        let sender = AgentTurnSender {
            dispatcher: self,
            route,
            invoker,
            ctx,
            attempts: AtomicU32::new(0),
        };
        let run = self
            .tool_loop
            .run(&sender, self.executor.as_ref(), messages, None)
            .await?;

        tracing::debug!(
            call_id = %ctx.call_id,
            rounds = run.rounds.len(),
            backend_calls = run.backend_calls,
            forced_final = run.forced_final,
            "Agentic run complete"
        );
        Ok((run.text, run.tokens_used, sender.attempts.load(Ordering::Relaxed)))
    }

    // ------------------------------------------------------------------------
    // Runtime controls and introspection
    // ------------------------------------------------------------------------

    /// Disable a route; returns false for unknown routes
    pub fn disable_route(&self, route_id: u32) -> bool {
        if !self.routes.contains(route_id) {
            return false;
        }
        if self.disabled.write().insert(route_id) {
            tracing::info!(route = route_id, "Route disabled");
        }
        true
    }

    /// Re-enable a route; returns false if it was not disabled
    pub fn enable_route(&self, route_id: u32) -> bool {
        let removed = self.disabled.write().remove(&route_id);
        if removed {
            tracing::info!(route = route_id, "Route enabled");
        }
        removed
    }

    /// Whether a route is operationally disabled
    #[must_use]
    pub fn is_disabled(&self, route_id: u32) -> bool {
        self.disabled.read().contains(&route_id)
    }

    /// Whether a live cache entry exists for this request
    #[must_use]
    pub fn is_cached(&self, route_id: u32, payload: &str, options: &DispatchOptions) -> bool {
        self.cache
            .contains(&CacheKey::new(route_id, payload, &options.cache_fingerprint()))
    }

    /// Registered routes
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Fallback edges
    #[must_use]
    pub fn fallback_graph(&self) -> &FallbackGraph {
        &self.fallback
    }

    /// Response cache
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Dispatch counters
    #[must_use]
    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// History compressor, if enabled
    #[must_use]
    pub fn compressor(&self) -> Option<&ConversationCompressor> {
        self.compressor.as_ref()
    }
}

// ============================================================================
// Agentic plumbing
// ============================================================================

/// Sends agentic turns through the retry controller
struct AgentTurnSender<'a> {
    dispatcher: &'a RouteDispatcher,
    route: &'a Route,
    invoker: &'a dyn BackendInvoker,
    ctx: &'a CallContext,
    attempts: AtomicU32,
}

#[async_trait]
impl TurnSender for AgentTurnSender<'_> {
    type Error = RouteFailure;

    async fn send_turn(
        &self,
        messages: &[ChatMessage],
        tools_enabled: bool,
    ) -> Result<BackendReply, RouteFailure> {
        let mut request = self
            .dispatcher
            .request_for(self.route, self.ctx, messages.to_vec());
        request.tools = self.ctx.options.tools.clone();
        request.tools_enabled = tools_enabled && !request.tools.is_empty();

        let outcome = self
            .dispatcher
            .retry
            .run(self.route, self.invoker, request, self.ctx.options.timeout)
            .await?;
        let served = settle(outcome)?;
        self.attempts.fetch_add(served.attempts, Ordering::Relaxed);
        Ok(served.reply)
    }
}

/// Summarises history by dispatching to the summary route
struct RouteSummarizer<'a> {
    dispatcher: &'a RouteDispatcher,
    route_id: u32,
}

#[async_trait]
impl Summarizer for RouteSummarizer<'_> {
    async fn summarize(&self, transcript: &str) -> Result<String, SummarizeError> {
        let options = DispatchOptions::from_source(COMPRESSOR_SOURCE).with_system(SUMMARY_SYSTEM_PROMPT);
        self.dispatcher
            .dispatch_result(self.route_id, transcript, options)
            .await
            .map_err(|e| SummarizeError(e.to_string()))
    }
}
