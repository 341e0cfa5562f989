//! Per-Call Dispatch Options
//!
//! Typed configuration for a single dispatch. Every recognised option is a
//! field with an explicit default; there is no pass-through bag.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::ChatMessage;

/// Label used when a caller does not identify itself
pub const UNKNOWN_SOURCE: &str = "unknown";

/// A tool the agentic backend may request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name
    pub name: String,
    /// Human-readable description shown to the model
    pub description: String,
    /// JSON schema of the arguments
    #[serde(default)]
    pub parameters: Value,
}

impl ToolSpec {
    /// Create a tool description
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Options for one dispatch call
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Caller label for usage accounting
    pub source: String,
    /// System prompt
    pub system: Option<String>,
    /// Structured-output schema
    pub schema: Option<Value>,
    /// Tools offered to the agentic route
    pub tools: Vec<ToolSpec>,
    /// Attached file references
    pub files: Vec<String>,
    /// Prior conversation (agentic route)
    pub history: Vec<ChatMessage>,
    /// Per-call timeout override
    pub timeout: Option<Duration>,
    /// Maximum tokens to generate (0 = backend default)
    pub max_tokens: u32,
    /// Whether the response cache may be consulted and written
    pub use_cache: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            source: UNKNOWN_SOURCE.to_string(),
            system: None,
            schema: None,
            tools: Vec::new(),
            files: Vec::new(),
            history: Vec::new(),
            timeout: None,
            max_tokens: 0,
            use_cache: true,
        }
    }
}

/// The subset of options that changes what a backend returns
#[derive(Serialize)]
struct CacheRelevant<'a> {
    system: &'a Option<String>,
    schema: &'a Option<Value>,
    tools: &'a [ToolSpec],
    files: &'a [String],
    history: &'a [ChatMessage],
    max_tokens: u32,
}

impl DispatchOptions {
    /// Options tagged with a caller label
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Set the caller label
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Request structured output
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Offer tools
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach files
    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Provide prior conversation
    #[must_use]
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    /// Override the route timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cap generated tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Enable or bypass the response cache
    #[must_use]
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Stable serialisation of the response-shaping options.
    ///
    /// The caller label and timeout are excluded: they do not change the
    /// backend output.
    #[must_use]
    pub fn cache_fingerprint(&self) -> String {
        let relevant = CacheRelevant {
            system: &self.system,
            schema: &self.schema,
            tools: &self.tools,
            files: &self.files,
            history: &self.history,
            max_tokens: self.max_tokens,
        };
        serde_json::to_string(&relevant).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = DispatchOptions::default();
        assert_eq!(options.source, UNKNOWN_SOURCE);
        assert!(options.use_cache);
        assert!(options.tools.is_empty());
        assert!(options.timeout.is_none());
    }

    #[test]
    fn test_fingerprint_ignores_source_and_timeout() {
        let a = DispatchOptions::from_source("scheduler").with_timeout(Duration::from_secs(1));
        let b = DispatchOptions::from_source("trader");
        assert_eq!(a.cache_fingerprint(), b.cache_fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_schema() {
        let plain = DispatchOptions::default();
        let schema = DispatchOptions::default().with_schema(json!({"type": "object"}));
        assert_ne!(plain.cache_fingerprint(), schema.cache_fingerprint());
    }
}
