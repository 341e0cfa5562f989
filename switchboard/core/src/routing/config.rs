//! Routing Configuration
//!
//! Route definitions, the route table, and the retry and dispatch settings the
//! dispatcher is built from.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Backend Kind
// ============================================================================

/// The kind of backend a route talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Text generation
    Text,
    /// Image generation
    Image,
    /// Speech / audio generation
    Audio,
    /// Video generation (long-running, polled)
    Video,
    /// Embedding vectors
    Embedding,
    /// Tool-calling chat
    Agentic,
}

impl BackendKind {
    /// All backend kinds
    pub const ALL: [BackendKind; 6] = [
        Self::Text,
        Self::Image,
        Self::Audio,
        Self::Video,
        Self::Embedding,
        Self::Agentic,
    ];

    /// Hard per-call timeout when the route does not override it
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Text => Duration::from_secs(60),
            Self::Embedding => Duration::from_secs(15),
            Self::Agentic => Duration::from_secs(120),
            Self::Image | Self::Audio => Duration::from_secs(180),
            Self::Video => Duration::from_secs(900),
        }
    }

    /// Whether outputs are deterministic enough to cache
    ///
    /// Generated media is intentionally varied, and agentic answers depend on
    /// tool side effects.
    #[must_use]
    pub fn cacheable_by_default(&self) -> bool {
        !matches!(self, Self::Image | Self::Video | Self::Agentic)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Embedding => "embedding",
            Self::Agentic => "agentic",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown backend kind: {s}"))
    }
}

// ============================================================================
// Route
// ============================================================================

/// A numbered endpoint: one backend kind plus one model
///
/// Routes are registered at startup and never mutated; the table hands out
/// `Arc<Route>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Unique, stable route id
    pub id: u32,
    /// Backend kind
    pub kind: BackendKind,
    /// Backend-specific model identifier
    pub model: String,
    /// Free-form labels copied into usage records
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Cacheability override
    #[serde(default)]
    pub cacheable: Option<bool>,
    /// Timeout override
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
    /// Attempt bound override
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Route {
    /// Create a route with kind defaults
    pub fn new(id: u32, kind: BackendKind, model: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            model: model.into(),
            metadata: BTreeMap::new(),
            cacheable: None,
            timeout: None,
            max_attempts: None,
        }
    }

    /// Add a metadata label
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override cacheability
    #[must_use]
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = Some(cacheable);
        self
    }

    /// Override the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the attempt bound
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Effective cacheability
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
            .unwrap_or_else(|| self.kind.cacheable_by_default())
    }

    /// Effective per-call timeout
    #[must_use]
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.kind.default_timeout())
    }

    /// Effective attempt bound, at least 1
    #[must_use]
    pub fn effective_max_attempts(&self, retry: &RetryConfig) -> u32 {
        self.max_attempts.unwrap_or(retry.max_attempts).max(1)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

// ============================================================================
// Retry / Dispatch Settings
// ============================================================================

/// Retry and quarantine policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Linear backoff unit: attempt N waits `base_delay * N`
    pub base_delay_ms: u64,

    /// Attempts per route when the route does not override it
    pub max_attempts: u32,

    /// Non-auth fatal errors on one route before the credential is quarantined
    pub quarantine_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_attempts: 3,
            quarantine_threshold: 2,
        }
    }
}

impl RetryConfig {
    /// Backoff before retrying after attempt N (1-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Dispatcher-wide settings
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchConfig {
    /// Substitute for disabled routes
    pub default_route: Option<u32>,
    /// Routes disabled at startup
    pub disabled_routes: Vec<u32>,
    /// Response cache TTL
    pub cache_ttl: Duration,
    /// Response cache bound
    pub cache_max_entries: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_route: None,
            disabled_routes: Vec::new(),
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 1024,
        }
    }
}

// ============================================================================
// Route Table
// ============================================================================

/// Route registration failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    /// Route id registered twice
    #[error("route {0} is already registered")]
    Duplicate(u32),
}

/// Registered routes by id
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: HashMap<u32, Arc<Route>>,
}

impl RouteTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route
    pub fn register(&mut self, route: Route) -> Result<(), RouteTableError> {
        if self.routes.contains_key(&route.id) {
            return Err(RouteTableError::Duplicate(route.id));
        }
        self.routes.insert(route.id, Arc::new(route));
        Ok(())
    }

    /// Look up a route
    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<Route>> {
        self.routes.get(&id).cloned()
    }

    /// Whether a route is registered
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.routes.contains_key(&id)
    }

    /// All routes ordered by id
    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by_key(|r| r.id);
        routes
    }

    /// Number of routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
