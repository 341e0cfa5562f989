//! Shared fixtures for dispatcher integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use switchboard_core::test_utils::{ModelStubInvoker, RecordingUsageLogger};
use switchboard_core::{
    BackendKind, DispatchConfig, RetryConfig, Route, RouteDispatcher, RouteDispatcherBuilder,
};

/// Retry policy without backoff delays
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        base_delay_ms: 0,
        max_attempts,
        quarantine_threshold: 2,
    }
}

/// Builder with the stub serving every backend kind
pub fn stub_builder(stub: &Arc<ModelStubInvoker>) -> RouteDispatcherBuilder {
    let mut builder = RouteDispatcher::builder().with_retry_config(fast_retry(2));
    for kind in BackendKind::ALL {
        builder = builder.with_invoker(kind, stub.clone());
    }
    builder
}

/// Dispatcher plus the stubs behind it
pub struct Harness {
    pub stub: Arc<ModelStubInvoker>,
    pub usage: Arc<RecordingUsageLogger>,
    pub dispatcher: RouteDispatcher,
}

/// Route 1 ("primary") falls back to route 2 ("fast"); route 3 is an image route
pub fn two_text_routes() -> Harness {
    two_text_routes_with_ttl(Duration::from_secs(3600))
}

/// Same as [`two_text_routes`] with a custom cache TTL
pub fn two_text_routes_with_ttl(ttl: Duration) -> Harness {
    let stub = Arc::new(ModelStubInvoker::new());
    let usage = Arc::new(RecordingUsageLogger::new());
    let dispatcher = stub_builder(&stub)
        .with_route(Route::new(1, BackendKind::Text, "primary").with_metadata("tier", "large"))
        .with_route(Route::new(2, BackendKind::Text, "fast"))
        .with_route(Route::new(3, BackendKind::Image, "painter"))
        .with_fallback(1, 2)
        .with_usage_logger(usage.clone())
        .with_dispatch_config(DispatchConfig {
            cache_ttl: ttl,
            ..Default::default()
        })
        .build()
        .expect("valid dispatcher");
    Harness {
        stub,
        usage,
        dispatcher,
    }
}
