//! Retry/Backoff Controller
//!
//! Runs one route's attempts against its invoker:
//!
//! - Transient errors are retried with linear backoff (`base * attempt`),
//!   stretched to any server-provided `Retry-After`. With more than one
//!   credential, a transient failure also rotates the credential.
//! - Fatal errors stop immediately. An auth failure quarantines the credential
//!   at once; other fatal errors quarantine it after `quarantine_threshold`
//!   occurrences on the same route.
//! - Running out of attempts is reported as [`RetryOutcome::Exhausted`], distinct
//!   from a single fatal error, so the dispatcher only falls back on exhaustion.
//!
//! Every attempt carries a hard timeout; a timeout is transient. A panicking
//! invoker is caught and classified fatal.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;

use super::config::{RetryConfig, Route};
use super::metrics::DispatchMetrics;
use crate::backend::{BackendError, BackendInvoker, BackendReply, InvokeRequest};
use crate::credentials::{Credential, CredentialError, CredentialSource};

/// Result of running a route's attempts
#[derive(Clone, Debug, PartialEq)]
pub enum RetryOutcome {
    /// An attempt succeeded
    Success {
        /// Backend reply
        reply: BackendReply,
        /// Attempts used (1-indexed)
        attempts: u32,
    },
    /// A non-retryable error ended the run
    Fatal {
        /// The error
        error: BackendError,
        /// Attempts used
        attempts: u32,
    },
    /// Every attempt failed transiently
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: BackendError,
    },
}

impl RetryOutcome {
    /// Whether the run ended in exhaustion
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Rate-limit aware backoff: at least the server-provided delay
#[must_use]
pub fn adjust_for_rate_limit(error: &BackendError, backoff: Duration) -> Duration {
    error
        .retry_after()
        .map_or(backoff, |retry_after| backoff.max(retry_after))
}

/// Retry/backoff controller shared by every route
pub struct RetryController {
    config: RetryConfig,
    credentials: Arc<dyn CredentialSource>,
    metrics: Arc<DispatchMetrics>,
    /// Fatal error counts per (credential id, route)
    fatal_counts: DashMap<(String, u32), u32>,
}

impl RetryController {
    /// Create a controller
    pub fn new(
        config: RetryConfig,
        credentials: Arc<dyn CredentialSource>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            config,
            credentials,
            metrics,
            fatal_counts: DashMap::new(),
        }
    }

    /// Retry policy in effect
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run attempts for `route` until success, a fatal error, or exhaustion
    ///
    /// `timeout` overrides the route's own per-attempt timeout.
    pub async fn run(
        &self,
        route: &Route,
        invoker: &dyn BackendInvoker,
        mut request: InvokeRequest,
        timeout: Option<Duration>,
    ) -> Result<RetryOutcome, CredentialError> {
        let max_attempts = route.effective_max_attempts(&self.config);
        let timeout = timeout.unwrap_or_else(|| route.effective_timeout());
        let mut last = BackendError::Internal("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            let credential = self.credentials.get_active().await?;
            request.credential = credential.clone();

            tracing::debug!(
                route = route.id,
                model = %route.model,
                attempt,
                max_attempts,
                "Invoking backend"
            );

            match self.invoke_once(invoker, &request, timeout).await {
                Ok(reply) => {
                    if let Some(cred) = &credential {
                        self.fatal_counts.remove(&(cred.id.clone(), route.id));
                    }
                    return Ok(RetryOutcome::Success {
                        reply,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(
                        route = route.id,
                        attempt,
                        max_attempts,
                        error = %error,
                        "Transient backend failure"
                    );

                    if self.credentials.pool_size() > 1 {
                        self.credentials.rotate();
                    }

                    if attempt < max_attempts {
                        self.metrics.retries.inc();
                        let delay = adjust_for_rate_limit(
                            &error,
                            self.config.delay_for_attempt(attempt),
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last = error;
                }
                Err(error) => {
                    tracing::warn!(
                        route = route.id,
                        attempt,
                        error = %error,
                        "Fatal backend failure"
                    );
                    if let Some(cred) = &credential {
                        self.record_fatal(cred, route.id, &error);
                    }
                    return Ok(RetryOutcome::Fatal {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }

        Ok(RetryOutcome::Exhausted {
            attempts: max_attempts,
            last,
        })
    }

    async fn invoke_once(
        &self,
        invoker: &dyn BackendInvoker,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> Result<BackendReply, BackendError> {
        self.metrics.invocations.inc();
        let call = AssertUnwindSafe(invoker.invoke(request)).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(BackendError::Timeout(timeout)),
            Ok(Err(panic)) => Err(BackendError::Internal(format!(
                "{} panicked: {}",
                invoker.name(),
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(result)) => result,
        }
    }

    fn record_fatal(&self, credential: &Credential, route_id: u32, error: &BackendError) {
        let key = (credential.id.clone(), route_id);

        let quarantine = if error.implicates_credential() {
            true
        } else {
            let mut count = self.fatal_counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count >= self.config.quarantine_threshold.max(1)
        };

        if quarantine {
            self.fatal_counts.remove(&key);
            self.credentials
                .quarantine(credential, &format!("route {route_id}: {error}"));
            self.metrics.quarantines.inc();
        }
    }

    /// Fatal errors recorded for a credential on a route
    #[must_use]
    pub fn fatal_count(&self, credential_id: &str, route_id: u32) -> u32 {
        self.fatal_counts
            .get(&(credential_id.to_string(), route_id))
            .map_or(0, |count| *count)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::routing::config::BackendKind;
    use crate::test_utils::ScriptedInvoker;

    fn controller(credentials: Arc<dyn CredentialSource>) -> RetryController {
        RetryController::new(
            RetryConfig {
                base_delay_ms: 100,
                max_attempts: 3,
                quarantine_threshold: 2,
            },
            credentials,
            Arc::new(DispatchMetrics::new()),
        )
    }

    fn request() -> InvokeRequest {
        InvokeRequest::new(1, "m", Vec::new())
    }

    #[test]
    fn test_rate_limit_stretches_backoff() {
        let err = BackendError::RateLimited {
            retry_after_ms: Some(5000),
        };
        assert_eq!(
            adjust_for_rate_limit(&err, Duration::from_secs(1)),
            Duration::from_secs(5)
        );
        assert_eq!(
            adjust_for_rate_limit(&err, Duration::from_secs(9)),
            Duration::from_secs(9)
        );
        let err = BackendError::Unavailable("busy".into());
        assert_eq!(
            adjust_for_rate_limit(&err, Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let invoker = ScriptedInvoker::new(vec![
            Err(BackendError::Unavailable("busy".into())),
            Ok(BackendReply::text("ok")),
        ]);
        let ctl = controller(Arc::new(CredentialPool::empty()));
        let route = Route::new(1, BackendKind::Text, "m");

        let outcome = ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::Success {
                reply: BackendReply::text("ok"),
                attempts: 2
            }
        );
        assert_eq!(invoker.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_distinct_from_fatal() {
        let invoker = ScriptedInvoker::always(Err(BackendError::Connection("refused".into())));
        let ctl = controller(Arc::new(CredentialPool::empty()));
        let route = Route::new(1, BackendKind::Text, "m");

        let outcome = ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert!(outcome.is_exhausted());
        assert_eq!(invoker.calls(), 3);

        let invoker = ScriptedInvoker::always(Err(BackendError::MalformedRequest("bad".into())));
        let outcome = ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert!(matches!(outcome, RetryOutcome::Fatal { attempts: 1, .. }));
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let invoker = ScriptedInvoker::always(Ok(BackendReply::text("late")))
            .with_delay(Duration::from_secs(10));
        let ctl = controller(Arc::new(CredentialPool::empty()));
        let route = Route::new(1, BackendKind::Text, "m")
            .with_timeout(Duration::from_secs(1))
            .with_max_attempts(2);

        let outcome = ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 2,
                last: BackendError::Timeout(Duration::from_secs(1))
            }
        );
    }

    #[tokio::test]
    async fn test_panicking_invoker_is_fatal() {
        let invoker = ScriptedInvoker::panicking();
        let ctl = controller(Arc::new(CredentialPool::empty()));
        let route = Route::new(1, BackendKind::Text, "m");

        let outcome = ctl.run(&route, &invoker, request(), None).await.unwrap();
        match outcome {
            RetryOutcome::Fatal {
                error: BackendError::Internal(msg),
                ..
            } => assert!(msg.contains("panicked")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_rotates_credentials() {
        let pool = Arc::new(CredentialPool::new(vec![
            Credential::new("a", "sa"),
            Credential::new("b", "sb"),
        ]));
        let invoker = ScriptedInvoker::new(vec![
            Err(BackendError::RateLimited {
                retry_after_ms: None,
            }),
            Ok(BackendReply::text("ok")),
        ]);
        let ctl = controller(pool.clone());
        let route = Route::new(1, BackendKind::Text, "m");

        ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert_eq!(invoker.credentials_seen(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_auth_failure_quarantines_immediately() {
        let pool = Arc::new(CredentialPool::new(vec![
            Credential::new("a", "sa"),
            Credential::new("b", "sb"),
        ]));
        let invoker = ScriptedInvoker::always(Err(BackendError::AuthFailed("401".into())));
        let ctl = controller(pool.clone());
        let route = Route::new(1, BackendKind::Text, "m");

        ctl.run(&route, &invoker, request(), None).await.unwrap();
        let states = pool.states();
        assert!(states[0].quarantined);
        assert!(!states[1].quarantined);
    }

    #[tokio::test]
    async fn test_repeated_fatal_quarantines_at_threshold() {
        let pool = Arc::new(CredentialPool::new(vec![
            Credential::new("a", "sa"),
            Credential::new("b", "sb"),
        ]));
        let invoker = ScriptedInvoker::always(Err(BackendError::UnknownModel("m".into())));
        let ctl = controller(pool.clone());
        let route = Route::new(1, BackendKind::Text, "m");

        ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert_eq!(ctl.fatal_count("a", 1), 1);
        assert!(!pool.states()[0].quarantined);

        ctl.run(&route, &invoker, request(), None).await.unwrap();
        assert!(pool.states()[0].quarantined);
        assert_eq!(ctl.fatal_count("a", 1), 0);
    }
}
