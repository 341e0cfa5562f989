//! Polling Invoker
//!
//! Adapts a submit/status job API (video and other long-running generation)
//! into a [`BackendInvoker`]. The job is submitted once, then its status is
//! polled at a fixed interval. Polling is bounded by a maximum wall-clock
//! duration; past it the call fails closed with [`BackendError::Timeout`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::traits::{BackendError, BackendInvoker, BackendReply, InvokeRequest};

/// State of a submitted job
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// Accepted, not started
    Queued,
    /// In progress
    Running {
        /// Completion fraction, if reported
        progress: Option<f32>,
    },
    /// Finished with a result
    Completed(BackendReply),
    /// Finished with an error
    Failed(BackendError),
}

/// A backend that runs requests as asynchronous jobs
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Submit a job, returning its id
    async fn submit(&self, request: &InvokeRequest) -> Result<String, BackendError>;

    /// Current status of a job
    async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError>;
}

/// Bounded polling adapter
pub struct PollingInvoker<B> {
    backend: B,
    poll_interval: Duration,
    max_wait: Duration,
}

impl<B: JobBackend> PollingInvoker<B> {
    /// Wrap a job backend
    pub fn new(backend: B, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            max_wait,
        }
    }

    /// Maximum wall-clock time for one job
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

#[async_trait]
impl<B: JobBackend> BackendInvoker for PollingInvoker<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<BackendReply, BackendError> {
        let deadline = Instant::now() + self.max_wait;
        let job_id = self.backend.submit(request).await?;
        tracing::debug!(job = %job_id, backend = %self.backend.name(), "Submitted job");

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(job = %job_id, "Job exceeded maximum wait, giving up");
                return Err(BackendError::Timeout(self.max_wait));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;

            match self.backend.status(&job_id).await {
                Ok(JobStatus::Completed(reply)) => return Ok(reply),
                Ok(JobStatus::Failed(error)) => return Err(error),
                Ok(JobStatus::Queued) => {}
                Ok(JobStatus::Running { progress }) => {
                    tracing::trace!(job = %job_id, ?progress, "Job running");
                }
                Err(error) if error.is_transient() => {
                    tracing::debug!(job = %job_id, error = %error, "Status check failed, will poll again");
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Completes after `ready_after` status checks
    struct FakeJobs {
        ready_after: u32,
        checks: AtomicU32,
        fail_with: Option<BackendError>,
    }

    impl FakeJobs {
        fn new(ready_after: u32) -> Self {
            Self {
                ready_after,
                checks: AtomicU32::new(0),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl JobBackend for FakeJobs {
        fn name(&self) -> &str {
            "fake-jobs"
        }

        async fn submit(&self, _request: &InvokeRequest) -> Result<String, BackendError> {
            Ok("job-1".to_string())
        }

        async fn status(&self, _job_id: &str) -> Result<JobStatus, BackendError> {
            let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = &self.fail_with {
                return Ok(JobStatus::Failed(err.clone()));
            }
            if n == 1 {
                return Err(BackendError::Connection("blip".into()));
            }
            if n >= self.ready_after {
                Ok(JobStatus::Completed(BackendReply::text("video.mp4")))
            } else {
                Ok(JobStatus::Running {
                    progress: Some(n as f32 / self.ready_after as f32),
                })
            }
        }
    }

    fn request() -> InvokeRequest {
        InvokeRequest::new(5, "veo", Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_complete() {
        let invoker = PollingInvoker::new(
            FakeJobs::new(4),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let reply = invoker.invoke(&request()).await.unwrap();
        assert_eq!(reply.text, "video.mp4");
        assert_eq!(invoker.backend.checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_closed_past_max_wait() {
        let invoker = PollingInvoker::new(
            FakeJobs::new(1000),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let err = invoker.invoke(&request()).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_secs(30)));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_failure_propagates() {
        let mut jobs = FakeJobs::new(2);
        jobs.fail_with = Some(BackendError::MalformedRequest("bad prompt".into()));
        let invoker = PollingInvoker::new(jobs, Duration::from_secs(1), Duration::from_secs(10));
        let err = invoker.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::MalformedRequest(_)));
    }
}
