//! Switchboard CLI - Operator Tool for the Route Dispatcher
//!
//! Loads the switchboard configuration, inspects the route table, and sends
//! single payloads through the dispatcher against a live Ollama server.
//!
//! # Usage
//!
//! ```bash
//! # List configured routes
//! switchboard routes
//!
//! # Validate configuration and probe the backend
//! switchboard check --ping
//!
//! # Dispatch one payload
//! switchboard dispatch 1 "Name three rivers" --source ops
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard dispatch 1 "hi"
//! ```
//!
//! API keys for the backend are read from `SWITCHBOARD_API_KEYS`
//! (comma separated) and rotated by the dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use switchboard_core::blocking::BlockingPool;
use switchboard_core::{
    default_config_path, error_kind_of, load_config_from_path, BackendInvoker, BackendKind,
    ConfigOverrides, Credential, CredentialPool, DispatchOptions, RouteDispatcher,
    SwitchboardConfig,
};

/// Backend kinds served by the Ollama chat endpoint
const CHAT_KINDS: [BackendKind; 2] = [BackendKind::Text, BackendKind::Agentic];

/// Switchboard - route payloads to LLM backends
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Override the default route
    #[arg(long, value_name = "ROUTE")]
    default_route: Option<u32>,

    /// Disable a route for this invocation (repeatable)
    #[arg(long = "disable", value_name = "ROUTE")]
    disable: Vec<u32>,

    /// Override the attempt bound
    #[arg(long)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured routes and fallback edges
    Routes,

    /// Validate the configuration and build a dispatcher
    Check {
        /// Also contact the Ollama server and list its models
        #[arg(long)]
        ping: bool,
    },

    /// Send one payload through the dispatcher
    Dispatch {
        /// Route id
        route: u32,

        /// Payload text
        payload: String,

        /// Caller label for usage accounting
        #[arg(long, default_value = "switchboard-cli")]
        source: String,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        /// Per-attempt timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Print dispatch metrics after the call
        #[arg(long)]
        metrics: bool,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("switchboard_core={level},switchboard={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load(args: &Args) -> Result<SwitchboardConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(route) = args.default_route {
        overrides = overrides.with_default_route(route);
    }
    for &route in &args.disable {
        overrides = overrides.with_disabled_route(route);
    }
    if let Some(attempts) = args.max_attempts {
        overrides = overrides.with_max_attempts(attempts);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(source = %config.source(), routes = config.routes.len(), "Configuration loaded");
    Ok(config)
}

fn credentials_from_env() -> CredentialPool {
    let keys: Vec<Credential> = std::env::var("SWITCHBOARD_API_KEYS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .enumerate()
        .map(|(i, key)| Credential::new(format!("key-{}", i + 1), key))
        .collect();
    CredentialPool::new(keys)
}

/// Keep only routes the Ollama invoker can serve
fn chat_routes_only(config: &SwitchboardConfig) -> Result<SwitchboardConfig> {
    let mut config = config.clone();
    config.routes.retain(|route| {
        let supported = CHAT_KINDS.contains(&route.kind);
        if !supported {
            warn!(route = route.id, kind = %route.kind, "No invoker for route kind, skipping");
        }
        supported
    });
    let ids: Vec<u32> = config.routes.iter().map(|r| r.id).collect();
    config
        .fallbacks
        .retain(|(from, to)| ids.contains(from) && ids.contains(to));
    config
        .validate()
        .context("Configuration is unusable without non-chat routes")?;
    Ok(config)
}

async fn build_dispatcher(config: &SwitchboardConfig) -> Result<RouteDispatcher> {
    let config = chat_routes_only(config)?;
    let invoker: Arc<dyn BackendInvoker> = Arc::new(config.ollama_invoker());

    let mut builder = config
        .dispatcher_builder()
        .with_credentials(Arc::new(credentials_from_env()));
    for kind in CHAT_KINDS {
        builder = builder.with_invoker(kind, Arc::clone(&invoker));
    }
    if let Some((compressor, summary_route)) = config
        .open_compressor(BlockingPool::default())
        .await
        .context("Failed to open compression store")?
    {
        builder = builder.with_compressor(compressor, summary_route);
    }

    builder.build().context("Failed to build dispatcher")
}

fn print_routes(config: &SwitchboardConfig) {
    println!(
        "{:>5}  {:<10} {:<28} {:>9} {:>8} {:>8}  status",
        "id", "kind", "model", "cacheable", "timeout", "fallback"
    );
    let mut routes = config.routes.clone();
    routes.sort_by_key(|r| r.id);
    for route in routes {
        let fallback = config
            .fallbacks
            .iter()
            .find(|(from, _)| *from == route.id)
            .map_or_else(|| "-".to_string(), |(_, to)| to.to_string());
        let status = if config.dispatch.disabled_routes.contains(&route.id) {
            "disabled"
        } else if config.dispatch.default_route == Some(route.id) {
            "default"
        } else {
            "enabled"
        };
        println!(
            "{:>5}  {:<10} {:<28} {:>9} {:>7}s {:>8}  {status}",
            route.id,
            route.kind.as_str(),
            route.model,
            route.is_cacheable(),
            route.effective_timeout().as_secs(),
            fallback,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    let config = load(&args)?;

    match &args.command {
        Command::Routes => print_routes(&config),

        Command::Check { ping } => {
            let dispatcher = build_dispatcher(&config).await?;
            println!(
                "configuration ok: {} routes, {} fallback edges",
                dispatcher.routes().len(),
                dispatcher.fallback_graph().len()
            );
            if *ping {
                let invoker = config.ollama_invoker();
                if !invoker.health_check().await {
                    anyhow::bail!("Ollama is not reachable at {}", invoker.base_url());
                }
                let models = invoker
                    .list_models()
                    .await
                    .context("Failed to list models")?;
                for route in dispatcher.routes().routes() {
                    let present = models.iter().any(|m| m == &route.model);
                    println!(
                        "route {:>3}: {} {}",
                        route.id,
                        route.model,
                        if present { "available" } else { "MISSING" }
                    );
                }
            }
        }

        Command::Dispatch {
            route,
            payload,
            source,
            system,
            timeout,
            metrics,
        } => {
            let dispatcher = build_dispatcher(&config).await?;
            let mut options = DispatchOptions::from_source(source.clone());
            if let Some(system) = system {
                options = options.with_system(system.clone());
            }
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(*secs));
            }

            let response = dispatcher.dispatch(*route, payload, options).await;
            println!("{response}");

            if *metrics {
                let snapshot = serde_json::to_string_pretty(&dispatcher.metrics().snapshot())?;
                eprintln!("{snapshot}");
            }
            if let Some(kind) = error_kind_of(&response) {
                anyhow::bail!("dispatch failed ({kind})");
            }
        }
    }

    Ok(())
}
