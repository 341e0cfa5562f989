//! TOML Configuration File Support
//!
//! Loads the switchboard configuration from
//! `$XDG_CONFIG_HOME/switchboard/switchboard.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [dispatch]
//! default_route = 1
//! disabled_routes = [4]
//! cache_ttl_secs = 3600
//! cache_max_entries = 1024
//!
//! [retry]
//! base_delay_ms = 500
//! max_attempts = 3
//! quarantine_threshold = 2
//!
//! [agent]
//! max_rounds = 5
//!
//! [compression]
//! threshold = 20
//! keep_recent = 8
//! max_entries = 256
//! summary_route = 1
//! store_path = "/var/lib/switchboard/summaries.json"
//!
//! [backend]
//! ollama_host = "localhost"
//! ollama_port = 11434
//!
//! [[routes]]
//! id = 1
//! kind = "text"
//! model = "llama3.2"
//! fallback = 2
//!
//! [[routes]]
//! id = 2
//! kind = "text"
//! model = "qwen2.5"
//! timeout_secs = 30
//! metadata = { tier = "cheap" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{
    CompressionConfig, CompressionStore, CompressionStoreError, ConversationCompressor,
    ToolLoopConfig,
};
use crate::backend::OllamaInvoker;
use crate::blocking::BlockingPool;
use crate::routing::{BackendKind, DispatchConfig, RetryConfig, Route, RouteDispatcherBuilder};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[dispatch]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Substitute for disabled routes
    pub default_route: Option<u32>,
    /// Routes disabled at startup
    pub disabled_routes: Option<Vec<u32>>,
    /// Response cache TTL in seconds
    pub cache_ttl_secs: Option<u64>,
    /// Response cache bound
    pub cache_max_entries: Option<usize>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Linear backoff unit in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Attempts per route
    pub max_attempts: Option<u32>,
    /// Fatal errors before a credential is quarantined
    pub quarantine_threshold: Option<u32>,
}

/// `[agent]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentToml {
    /// Tool rounds before the forced final request
    pub max_rounds: Option<u32>,
    /// Instruction sent with the forced final request
    pub final_instruction: Option<String>,
}

/// `[compression]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionToml {
    /// History length above which compression applies
    pub threshold: Option<usize>,
    /// Recent messages kept verbatim
    pub keep_recent: Option<usize>,
    /// Summary cache bound
    pub max_entries: Option<usize>,
    /// Route used to produce summaries; compression is off without one
    pub summary_route: Option<u32>,
    /// Where summaries are persisted; in memory when absent
    pub store_path: Option<PathBuf>,
}

/// `[backend]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama host
    pub ollama_host: Option<String>,
    /// Ollama port
    pub ollama_port: Option<u16>,
}

/// One `[[routes]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteToml {
    /// Route id
    pub id: u32,
    /// Backend kind
    pub kind: BackendKind,
    /// Model identifier
    pub model: String,
    /// Fallback target
    #[serde(default)]
    pub fallback: Option<u32>,
    /// Cacheability override
    #[serde(default)]
    pub cacheable: Option<bool>,
    /// Timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Attempt bound override
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Labels copied into usage records
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RouteToml {
    fn to_route(&self) -> Route {
        Route {
            id: self.id,
            kind: self.kind,
            model: self.model.clone(),
            metadata: self.metadata.clone(),
            cacheable: self.cacheable,
            timeout: self.timeout_secs.map(Duration::from_secs),
            max_attempts: self.max_attempts,
        }
    }
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    /// Dispatch section
    pub dispatch: DispatchToml,
    /// Retry section
    pub retry: RetryToml,
    /// Agent section
    pub agent: AgentToml,
    /// Compression section
    pub compression: CompressionToml,
    /// Backend section
    pub backend: BackendToml,
    /// Route definitions
    pub routes: Vec<RouteToml>,
}

// =============================================================================
// Effective Configuration
// =============================================================================

/// Effective switchboard configuration
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Dispatcher-wide settings
    pub dispatch: DispatchConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Agentic loop limits
    pub tool_loop: ToolLoopConfig,
    /// Compression thresholds
    pub compression: CompressionConfig,
    /// Summary cache bound
    pub compression_max_entries: usize,
    /// Route that produces summaries
    pub summary_route: Option<u32>,
    /// Summary store location
    pub compression_store_path: Option<PathBuf>,
    /// Ollama host
    pub ollama_host: String,
    /// Ollama port
    pub ollama_port: u16,
    /// Registered routes
    pub routes: Vec<Route>,
    /// Fallback edges `(from, to)`
    pub fallbacks: Vec<(u32, u32)>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            tool_loop: ToolLoopConfig::default(),
            compression: CompressionConfig::default(),
            compression_max_entries: 256,
            summary_route: None,
            compression_store_path: None,
            ollama_host: "localhost".to_string(),
            ollama_port: 11434,
            routes: Vec::new(),
            fallbacks: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check route ids, fallback edges and referenced routes
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for route in &self.routes {
            if !ids.insert(route.id) {
                return Err(ConfigError::ValidationError(format!(
                    "route {} is defined more than once",
                    route.id
                )));
            }
            if route.model.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "route {} has an empty model",
                    route.id
                )));
            }
        }

        for &(from, to) in &self.fallbacks {
            if from == to {
                return Err(ConfigError::ValidationError(format!(
                    "route {from} falls back to itself"
                )));
            }
            if !ids.contains(&to) {
                return Err(ConfigError::ValidationError(format!(
                    "route {from} falls back to unknown route {to}"
                )));
            }
        }

        if let Some(default) = self.dispatch.default_route {
            if !ids.contains(&default) {
                return Err(ConfigError::ValidationError(format!(
                    "default route {default} is not defined"
                )));
            }
        }

        if let Some(summary) = self.summary_route {
            match self.routes.iter().find(|r| r.id == summary) {
                None => {
                    return Err(ConfigError::ValidationError(format!(
                        "summary route {summary} is not defined"
                    )))
                }
                Some(route) if route.kind == BackendKind::Agentic => {
                    return Err(ConfigError::ValidationError(format!(
                        "summary route {summary} must not be agentic"
                    )))
                }
                Some(_) => {}
            }
        }

        if self.compression.keep_recent > self.compression.threshold {
            return Err(ConfigError::ValidationError(format!(
                "compression keep_recent ({}) exceeds threshold ({})",
                self.compression.keep_recent, self.compression.threshold
            )));
        }

        Ok(())
    }

    /// Builder pre-loaded with routes, fallback edges and policies
    ///
    /// Invokers, credentials and the compressor are left to the caller.
    #[must_use]
    pub fn dispatcher_builder(&self) -> RouteDispatcherBuilder {
        let mut builder = RouteDispatcherBuilder::default()
            .with_dispatch_config(self.dispatch.clone())
            .with_retry_config(self.retry.clone())
            .with_tool_loop_config(self.tool_loop.clone());
        for route in &self.routes {
            builder = builder.with_route(route.clone());
        }
        for &(from, to) in &self.fallbacks {
            builder = builder.with_fallback(from, to);
        }
        builder
    }

    /// HTTP invoker for the configured Ollama endpoint
    #[must_use]
    pub fn ollama_invoker(&self) -> OllamaInvoker {
        OllamaInvoker::new(self.ollama_host.clone(), self.ollama_port)
    }

    /// Compressor plus summary route, when compression is configured
    pub async fn open_compressor(
        &self,
        pool: BlockingPool,
    ) -> Result<Option<(ConversationCompressor, u32)>, CompressionStoreError> {
        let Some(summary_route) = self.summary_route else {
            return Ok(None);
        };
        let store = match &self.compression_store_path {
            Some(path) => CompressionStore::open(path.clone(), self.compression_max_entries, pool).await?,
            None => CompressionStore::in_memory(self.compression_max_entries),
        };
        Ok(Some((
            ConversationCompressor::new(self.compression.clone(), store),
            summary_route,
        )))
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/switchboard/switchboard.toml`, typically
/// `~/.config/switchboard/switchboard.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("switchboard.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                routes = config.routes.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

/// Apply TOML values over the defaults
fn apply_toml_config(config: &mut SwitchboardConfig, toml: &SwitchboardToml) {
    // Dispatch
    if toml.dispatch.default_route.is_some() {
        config.dispatch.default_route = toml.dispatch.default_route;
    }
    if let Some(ref disabled) = toml.dispatch.disabled_routes {
        config.dispatch.disabled_routes = disabled.clone();
    }
    if let Some(ttl) = toml.dispatch.cache_ttl_secs {
        config.dispatch.cache_ttl = Duration::from_secs(ttl);
    }
    if let Some(max) = toml.dispatch.cache_max_entries {
        config.dispatch.cache_max_entries = max;
    }

    // Retry
    if let Some(delay) = toml.retry.base_delay_ms {
        config.retry.base_delay_ms = delay;
    }
    if let Some(attempts) = toml.retry.max_attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(threshold) = toml.retry.quarantine_threshold {
        config.retry.quarantine_threshold = threshold;
    }

    // Agent
    if let Some(rounds) = toml.agent.max_rounds {
        config.tool_loop.max_rounds = rounds;
    }
    if let Some(ref instruction) = toml.agent.final_instruction {
        config.tool_loop.final_instruction = instruction.clone();
    }

    // Compression
    if let Some(threshold) = toml.compression.threshold {
        config.compression.threshold = threshold;
    }
    if let Some(keep) = toml.compression.keep_recent {
        config.compression.keep_recent = keep;
    }
    if let Some(max) = toml.compression.max_entries {
        config.compression_max_entries = max;
    }
    if toml.compression.summary_route.is_some() {
        config.summary_route = toml.compression.summary_route;
    }
    if toml.compression.store_path.is_some() {
        config.compression_store_path = toml.compression.store_path.clone();
    }

    // Backend
    if let Some(ref host) = toml.backend.ollama_host {
        config.ollama_host = host.clone();
    }
    if let Some(port) = toml.backend.ollama_port {
        config.ollama_port = port;
    }

    // Routes
    config.routes = toml.routes.iter().map(RouteToml::to_route).collect();
    config.fallbacks = toml
        .routes
        .iter()
        .filter_map(|r| r.fallback.map(|to| (r.id, to)))
        .collect();
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!("{key} has an invalid value: {value:?}"))
    })
}

/// Apply environment variable overrides
fn apply_env_config(
    config: &mut SwitchboardConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(value) = env("SWITCHBOARD_DEFAULT_ROUTE") {
        config.dispatch.default_route = Some(parse_env("SWITCHBOARD_DEFAULT_ROUTE", &value)?);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("SWITCHBOARD_CACHE_TTL") {
        let secs: u64 = parse_env("SWITCHBOARD_CACHE_TTL", &value)?;
        config.dispatch.cache_ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("SWITCHBOARD_DISABLED_ROUTES") {
        config.dispatch.disabled_routes = value
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| parse_env("SWITCHBOARD_DISABLED_ROUTES", part))
            .collect::<Result<_, _>>()?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("SWITCHBOARD_MAX_ATTEMPTS") {
        config.retry.max_attempts = parse_env("SWITCHBOARD_MAX_ATTEMPTS", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("SWITCHBOARD_AGENT_MAX_ROUNDS") {
        config.tool_loop.max_rounds = parse_env("SWITCHBOARD_AGENT_MAX_ROUNDS", &value)?;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("OLLAMA_HOST") {
        config.ollama_host = value;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("OLLAMA_PORT") {
        config.ollama_port = parse_env("OLLAMA_PORT", &value)?;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default route override
    pub default_route: Option<u32>,
    /// Extra routes to disable
    pub disable_routes: Vec<u32>,
    /// Attempt bound override
    pub max_attempts: Option<u32>,
    /// Ollama host override
    pub ollama_host: Option<String>,
    /// Ollama port override
    pub ollama_port: Option<u16>,
}

impl ConfigOverrides {
    /// Empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default route
    #[must_use]
    pub fn with_default_route(mut self, route: u32) -> Self {
        self.default_route = Some(route);
        self
    }

    /// Disable an additional route
    #[must_use]
    pub fn with_disabled_route(mut self, route: u32) -> Self {
        self.disable_routes.push(route);
        self
    }

    /// Set the attempt bound
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the Ollama endpoint
    #[must_use]
    pub fn with_ollama(mut self, host: impl Into<String>, port: u16) -> Self {
        self.ollama_host = Some(host.into());
        self.ollama_port = Some(port);
        self
    }

    fn is_empty(&self) -> bool {
        self.default_route.is_none()
            && self.disable_routes.is_empty()
            && self.max_attempts.is_none()
            && self.ollama_host.is_none()
            && self.ollama_port.is_none()
    }

    /// Apply overrides and re-validate
    pub fn apply(&self, config: &mut SwitchboardConfig) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        config.source = ConfigSource::Cli;

        if self.default_route.is_some() {
            config.dispatch.default_route = self.default_route;
        }
        for &route in &self.disable_routes {
            if !config.dispatch.disabled_routes.contains(&route) {
                config.dispatch.disabled_routes.push(route);
            }
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(ref host) = self.ollama_host {
            config.ollama_host = host.clone();
        }
        if let Some(port) = self.ollama_port {
            config.ollama_port = port;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
