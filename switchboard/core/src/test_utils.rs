//! Test Utilities
//!
//! Stub collaborators for exercising the dispatcher without real backends:
//!
//! - [`ModelStubInvoker`]: per-model canned replies and failures, with a
//!   request log so tests can assert which models were called and how often
//! - [`ScriptedInvoker`]: replays a fixed sequence of results
//! - [`RecordingExecutor`], [`RecordingUsageLogger`], [`CountingSummarizer`]
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::test_utils::ModelStubInvoker;
//!
//! let stub = Arc::new(ModelStubInvoker::new());
//! stub.set_response("fast", "hello");
//! stub.set_failure("reasoning", BackendError::Unavailable("down".into()));
//!
//! // After the test, verify which models were called
//! assert_eq!(stub.request_count("fast"), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::agent::{CapabilityExecutor, SummarizeError, Summarizer, ToolError};
use crate::backend::{BackendError, BackendInvoker, BackendReply, InvokeRequest};
use crate::conversation::ToolCall;
use crate::usage::{UsageLogError, UsageLogger, UsageRecord};

type StubResult = Result<BackendReply, BackendError>;

// ============================================================================
// Model Stub Invoker
// ============================================================================

/// What a stubbed model does when invoked
#[derive(Clone, Debug)]
enum StubBehavior {
    /// Same result every time
    Always(StubResult),
    /// Results in order; the last one repeats
    Script(VecDeque<StubResult>),
    /// Requests a tool while tools are enabled, answers text otherwise
    ToolUntilForced(String),
}

impl StubBehavior {
    fn next(&mut self, tools_enabled: bool) -> StubResult {
        match self {
            Self::Always(result) => result.clone(),
            Self::ToolUntilForced(tool) if tools_enabled => Ok(BackendReply::with_tool_calls(
                "",
                vec![ToolCall::new("call-1", tool.as_str(), json!({}))],
            )),
            Self::ToolUntilForced(_) => Ok(BackendReply::text("final answer after tool rounds")),
            Self::Script(queue) => {
                if queue.len() > 1 {
                    queue
                        .pop_front()
                        .unwrap_or_else(|| Err(BackendError::Internal("empty script".into())))
                } else {
                    queue
                        .front()
                        .cloned()
                        .unwrap_or_else(|| Err(BackendError::Internal("empty script".into())))
                }
            }
        }
    }
}

/// Invoker stub keyed by model name
///
/// Models without configured behaviour answer with `UnknownModel`.
#[derive(Default)]
pub struct ModelStubInvoker {
    behaviors: Mutex<HashMap<String, StubBehavior>>,
    requests: Mutex<Vec<InvokeRequest>>,
}

impl ModelStubInvoker {
    /// Stub with no models configured
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Model always answers `text`
    pub fn set_response(&self, model: &str, text: &str) {
        self.set_reply(model, BackendReply::text(text));
    }

    /// Model always answers `reply`, tool calls included, even when the
    /// request disables tools
    pub fn set_reply(&self, model: &str, reply: BackendReply) {
        self.behaviors
            .lock()
            .insert(model.to_string(), StubBehavior::Always(Ok(reply)));
    }

    /// Model always fails with `error`
    pub fn set_failure(&self, model: &str, error: BackendError) {
        self.behaviors
            .lock()
            .insert(model.to_string(), StubBehavior::Always(Err(error)));
    }

    /// Model replays `script`, repeating the last entry
    pub fn set_script(&self, model: &str, script: Vec<StubResult>) {
        self.behaviors
            .lock()
            .insert(model.to_string(), StubBehavior::Script(script.into()));
    }

    /// Model requests `tool` whenever tools are enabled, and answers plain
    /// text to the forced final request
    pub fn set_always_tool_call(&self, model: &str, tool: &str) {
        self.behaviors.lock().insert(
            model.to_string(),
            StubBehavior::ToolUntilForced(tool.to_string()),
        );
    }

    /// Requests received by `model`
    #[must_use]
    pub fn request_count(&self, model: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.model == model).count()
    }

    /// Requests received by every model
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Copies of the requests received by `model`, oldest first
    #[must_use]
    pub fn requests_for(&self, model: &str) -> Vec<InvokeRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }

    /// Forget recorded requests
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl BackendInvoker for ModelStubInvoker {
    fn name(&self) -> &str {
        "model-stub"
    }

    async fn invoke(&self, request: &InvokeRequest) -> StubResult {
        self.requests.lock().push(request.clone());
        let mut behaviors = self.behaviors.lock();
        let Some(behavior) = behaviors.get_mut(&request.model) else {
            return Err(BackendError::UnknownModel(request.model.clone()));
        };

        behavior.next(request.tools_enabled)
    }
}

// ============================================================================
// Scripted Invoker
// ============================================================================

/// Replays results in order, repeating the last one
pub struct ScriptedInvoker {
    script: Mutex<VecDeque<StubResult>>,
    delay: Option<Duration>,
    panic: bool,
    calls: AtomicU32,
    credentials_seen: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    /// Replay `script`
    #[must_use]
    pub fn new(script: Vec<StubResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delay: None,
            panic: false,
            calls: AtomicU32::new(0),
            credentials_seen: Mutex::new(Vec::new()),
        }
    }

    /// Same result on every call
    #[must_use]
    pub fn always(result: StubResult) -> Self {
        Self::new(vec![result])
    }

    /// Panics on every call
    #[must_use]
    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::new(Vec::new())
        }
    }

    /// Sleep before answering
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls made so far
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Credential ids seen, one per call
    #[must_use]
    pub fn credentials_seen(&self) -> Vec<String> {
        self.credentials_seen.lock().clone()
    }
}

#[async_trait]
impl BackendInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InvokeRequest) -> StubResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(credential) = &request.credential {
            self.credentials_seen.lock().push(credential.id.clone());
        }
        if self.panic {
            panic!("scripted invoker panic");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        if script.len() > 1 {
            script
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Internal("empty script".into())))
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(BackendError::Internal("empty script".into())))
        }
    }
}

// ============================================================================
// Collaborator stubs
// ============================================================================

/// Capability executor that records calls
///
/// Tool `fail` returns an error, tool `panic` panics; every other tool
/// returns `"<name> ok"`.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingExecutor {
    /// Executor with no calls recorded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool names executed, in order
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }
}

#[async_trait]
impl CapabilityExecutor for RecordingExecutor {
    async fn execute(&self, tool_name: &str, arguments: &Value) -> Result<String, ToolError> {
        self.calls
            .lock()
            .push((tool_name.to_string(), arguments.clone()));
        match tool_name {
            "fail" => return Err(ToolError::Failed("requested failure".to_string())),
            "panic" => panic!("tool panicked on request"),
            _ => {}
        }
        Ok(format!("{tool_name} ok"))
    }
}

/// Usage logger that keeps records in memory, optionally failing
#[derive(Default)]
pub struct RecordingUsageLogger {
    records: Mutex<Vec<UsageRecord>>,
    fail: bool,
}

impl RecordingUsageLogger {
    /// Logger that accepts records
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger that rejects every record
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Records accepted so far
    #[must_use]
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

impl UsageLogger for RecordingUsageLogger {
    fn record(&self, record: &UsageRecord) -> Result<(), UsageLogError> {
        if self.fail {
            return Err(UsageLogError("logger offline".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Summarizer that counts calls and returns a fixed digest
pub struct CountingSummarizer {
    summary: String,
    calls: AtomicU32,
}

impl CountingSummarizer {
    /// Summarizer answering `summary`
    #[must_use]
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            calls: AtomicU32::new(0),
        }
    }

    /// Calls made so far
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, _transcript: &str) -> Result<String, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.summary.clone())
    }
}
