//! Usage Accounting
//!
//! One [`UsageRecord`] per successful backend dispatch. Recording is
//! fire-and-forget: a failing logger is reported as a warning and never fails
//! the dispatch that produced the record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::conversation::estimate_tokens;
use crate::routing::{BackendKind, Route};

/// One usage-accounting record
#[derive(Clone, Debug, Serialize)]
pub struct UsageRecord {
    /// Dispatch correlation id
    pub call_id: Uuid,
    /// Route that served the response
    pub route_id: u32,
    /// Route originally requested (differs after a fallback hop)
    pub requested_route: u32,
    /// Backend kind
    pub kind: BackendKind,
    /// Model identifier
    pub model: String,
    /// Route metadata labels
    pub metadata: BTreeMap<String, String>,
    /// Input size in characters
    pub input_chars: usize,
    /// Output size in characters
    pub output_chars: usize,
    /// Estimated input tokens
    pub input_tokens: usize,
    /// Output tokens (backend-reported when available)
    pub output_tokens: usize,
    /// Caller label
    pub source: String,
    /// Backend attempts made on the serving route
    pub attempts: u32,
    /// When the record was produced
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Build a record for a response served by `route`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: Uuid,
        route: &Route,
        requested_route: u32,
        input: &str,
        output: &str,
        reported_tokens: Option<u32>,
        source: &str,
        attempts: u32,
    ) -> Self {
        Self {
            call_id,
            route_id: route.id,
            requested_route,
            kind: route.kind,
            model: route.model.clone(),
            metadata: route.metadata.clone(),
            input_chars: input.chars().count(),
            output_chars: output.chars().count(),
            input_tokens: estimate_tokens(input),
            output_tokens: reported_tokens.map_or_else(|| estimate_tokens(output), |t| t as usize),
            source: source.to_string(),
            attempts,
            timestamp: Utc::now(),
        }
    }
}

/// Usage logger failure
#[derive(Debug, Error)]
#[error("usage logger failed: {0}")]
pub struct UsageLogError(pub String);

/// Sink for usage records
pub trait UsageLogger: Send + Sync {
    /// Record one dispatch
    fn record(&self, record: &UsageRecord) -> Result<(), UsageLogError>;
}

/// Default logger: one `tracing` event per record on target `switchboard::usage`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingUsageLogger;

impl UsageLogger for TracingUsageLogger {
    fn record(&self, record: &UsageRecord) -> Result<(), UsageLogError> {
        tracing::info!(
            target: "switchboard::usage",
            call_id = %record.call_id,
            route = record.route_id,
            requested_route = record.requested_route,
            kind = %record.kind,
            model = %record.model,
            source = %record.source,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            attempts = record.attempts,
            "usage"
        );
        Ok(())
    }
}

/// Logger that discards records
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopUsageLogger;

impl UsageLogger for NoopUsageLogger {
    fn record(&self, _record: &UsageRecord) -> Result<(), UsageLogError> {
        Ok(())
    }
}

/// Hand a record to a logger, downgrading failure to a warning
pub(crate) fn record_quietly(logger: &dyn UsageLogger, record: &UsageRecord) {
    if let Err(e) = logger.record(record) {
        tracing::warn!(route = record.route_id, error = %e, "Usage record dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingLogger;

    impl UsageLogger for FailingLogger {
        fn record(&self, _record: &UsageRecord) -> Result<(), UsageLogError> {
            Err(UsageLogError("disk full".into()))
        }
    }

    fn record() -> UsageRecord {
        let route = Route::new(2, BackendKind::Text, "fast").with_metadata("tier", "cheap");
        UsageRecord::new(Uuid::new_v4(), &route, 1, "hello world!", "ok", None, "jobs", 1)
    }

    #[test]
    fn test_record_estimates() {
        let record = record();
        assert_eq!(record.input_chars, 12);
        assert_eq!(record.input_tokens, 3);
        assert_eq!(record.output_tokens, 1);
        assert_eq!(record.metadata.get("tier").map(String::as_str), Some("cheap"));
        assert_eq!(record.requested_route, 1);
    }

    #[test]
    fn test_record_serializes_with_timestamp() {
        let record = record();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["route_id"], 2);
        assert_eq!(value["kind"], "text");
        let stamp = value["timestamp"].as_str().unwrap();
        assert_eq!(
            stamp.parse::<DateTime<Utc>>().unwrap(),
            record.timestamp
        );
    }

    #[test]
    fn test_reported_tokens_win() {
        let route = Route::new(2, BackendKind::Text, "fast");
        let record = UsageRecord::new(Uuid::new_v4(), &route, 2, "a", "b", Some(40), "x", 1);
        assert_eq!(record.output_tokens, 40);
    }

    #[test]
    fn test_failing_logger_is_swallowed() {
        record_quietly(&FailingLogger, &record());
        assert!(TracingUsageLogger.record(&record()).is_ok());
    }
}
