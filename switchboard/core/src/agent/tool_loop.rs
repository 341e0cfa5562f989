//! Agentic Tool Loop
//!
//! Bounded request/response cycle that lets the agentic backend request tool
//! executions before it answers.
//!
//! # State Machine
//!
//! ```text
//!             +-------------------------------------------+
//!             v                                           |
//! DRAFTING --(tool calls, round < max)--> TOOL_REQUESTED --> EXECUTING_TOOLS
//!    |
//!    +--(plain text)--> FINALIZED
//!    |
//!    +--(rounds == max)--> forced final request (tools off) --> FINALIZED
//! ```
//!
//! The loop shuttles tool requests and results without interpreting them.
//! Tool failures (panics included) become tool-result text fed back to the
//! model; they never surface as dispatch errors. With an always-tool-calling backend the loop
//! makes exactly `max_rounds + 1` backend calls.

use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::backend::BackendReply;
use crate::conversation::{ChatMessage, ToolCall};
use crate::routing::retry::panic_message;

/// Instruction appended to the forced final request
pub const DEFAULT_FINAL_INSTRUCTION: &str =
    "You have used all available tool rounds. Do not request any more tools. \
     Answer the user now using the information gathered so far.";

// ============================================================================
// Capability Executor
// ============================================================================

/// Tool execution failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    /// No tool with that name
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments rejected by the tool
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments {
        /// Tool name
        tool: String,
        /// Why they were rejected
        reason: String,
    },

    /// The tool ran and failed
    #[error("tool failed: {0}")]
    Failed(String),
}

/// Runs tools on behalf of the agentic backend
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Execute a tool and return its textual result
    async fn execute(&self, tool_name: &str, arguments: &Value) -> Result<String, ToolError>;
}

/// Executor that knows no tools
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTools;

#[async_trait]
impl CapabilityExecutor for NoTools {
    async fn execute(&self, tool_name: &str, _arguments: &Value) -> Result<String, ToolError> {
        Err(ToolError::UnknownTool(tool_name.to_string()))
    }
}

// ============================================================================
// Turn Sender
// ============================================================================

/// Sends one conversation turn to the agentic backend
///
/// The dispatcher implements this on top of its retry controller, so every
/// turn is retried the same way as a plain dispatch.
#[async_trait]
pub trait TurnSender: Send + Sync {
    /// Failure that aborts the loop
    type Error: Send;

    /// Send the conversation; `tools_enabled` is false only for the forced
    /// final request
    async fn send_turn(
        &self,
        messages: &[ChatMessage],
        tools_enabled: bool,
    ) -> Result<BackendReply, Self::Error>;
}

// ============================================================================
// Loop
// ============================================================================

/// Loop states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the backend's next response
    Drafting,
    /// Backend asked for tools
    ToolRequested,
    /// Tools running
    ExecutingTools,
    /// Final text chosen
    Finalized,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drafting => "drafting",
            Self::ToolRequested => "tool_requested",
            Self::ExecutingTools => "executing_tools",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// One round of tool execution
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRound {
    /// 0-indexed round number
    pub round_index: u32,
    /// Calls the backend requested
    pub requested_calls: Vec<ToolCall>,
    /// Result text per call, in order
    pub results: Vec<String>,
}

/// Outcome of a loop run
#[derive(Clone, Debug, PartialEq)]
pub struct ToolLoopRun {
    /// Final answer
    pub text: String,
    /// Tool rounds executed
    pub rounds: Vec<ToolCallRound>,
    /// Backend calls made
    pub backend_calls: u32,
    /// Whether the answer came from the forced final request
    pub forced_final: bool,
    /// Tokens reported by the final backend call
    pub tokens_used: Option<u32>,
}

/// Loop limits
#[derive(Clone, Debug, PartialEq)]
pub struct ToolLoopConfig {
    /// Tool rounds before the forced final request
    pub max_rounds: u32,
    /// Instruction sent with the forced final request
    pub final_instruction: String,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            final_instruction: DEFAULT_FINAL_INSTRUCTION.to_string(),
        }
    }
}

/// The agentic tool loop
#[derive(Clone, Debug, Default)]
pub struct AgenticToolLoop {
    config: ToolLoopConfig,
}

impl AgenticToolLoop {
    /// Create a loop
    pub fn new(config: ToolLoopConfig) -> Self {
        Self { config }
    }

    /// Loop limits
    #[must_use]
    pub fn config(&self) -> &ToolLoopConfig {
        &self.config
    }

    /// Drive the conversation to a final answer
    ///
    /// `first` is the response to the initial request when the caller has
    /// already sent it; otherwise the loop starts by sending `messages`.
    pub async fn run<S: TurnSender>(
        &self,
        sender: &S,
        executor: &dyn CapabilityExecutor,
        mut messages: Vec<ChatMessage>,
        first: Option<BackendReply>,
    ) -> Result<ToolLoopRun, S::Error> {
        let mut rounds: Vec<ToolCallRound> = Vec::new();
        let mut backend_calls = 0u32;
        let mut pending = first;
        let mut state = LoopState::Drafting;

        loop {
            debug_assert_eq!(state, LoopState::Drafting);
            let reply = match pending.take() {
                Some(reply) => reply,
                None => {
                    backend_calls += 1;
                    sender.send_turn(&messages, true).await?
                }
            };

            let calls = requested_tool_calls(&reply);
            if calls.is_empty() {
                state = LoopState::Finalized;
                tracing::debug!(rounds = rounds.len(), %state, "Agentic loop finished");
                return Ok(ToolLoopRun {
                    text: reply.text,
                    rounds,
                    backend_calls,
                    forced_final: false,
                    tokens_used: reply.tokens_used,
                });
            }

            state = LoopState::ToolRequested;
            let round_index = rounds.len() as u32;
            tracing::trace!(round = round_index, %state, "Backend requested tools");
            if round_index >= self.config.max_rounds {
                break;
            }

            state = LoopState::ExecutingTools;
            tracing::debug!(round = round_index, tools = calls.len(), %state, "Executing tools");
            let results = execute_all(executor, &calls).await;

            messages.push(ChatMessage::assistant_with_calls(
                reply.text.clone(),
                calls.clone(),
            ));
            for (call, result) in calls.iter().zip(&results) {
                messages.push(ChatMessage::tool_result(call, result.clone()));
            }
            rounds.push(ToolCallRound {
                round_index,
                requested_calls: calls,
                results,
            });
            state = LoopState::Drafting;

            if rounds.len() as u32 >= self.config.max_rounds {
                break;
            }
        }

        tracing::info!(
            rounds = rounds.len(),
            max_rounds = self.config.max_rounds,
            "Tool rounds exhausted, forcing final answer"
        );
        messages.push(ChatMessage::user(self.config.final_instruction.clone()));
        backend_calls += 1;
        let reply = sender.send_turn(&messages, false).await?;

        let text = if reply.text.trim().is_empty() || !parse_embedded_tool_calls(&reply.text).is_empty()
        {
            format!(
                "I could not finish this request: the tool budget of {} rounds ran out before a final answer was produced.",
                self.config.max_rounds
            )
        } else {
            reply.text
        };

        Ok(ToolLoopRun {
            text,
            rounds,
            backend_calls,
            forced_final: true,
            tokens_used: reply.tokens_used,
        })
    }
}

async fn execute_all(executor: &dyn CapabilityExecutor, calls: &[ToolCall]) -> Vec<String> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let execution = AssertUnwindSafe(executor.execute(&call.name, &call.arguments));
        let result = match execution.catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool execution failed");
                format!("Error: {e}")
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(tool = %call.name, panic = %message, "Tool execution panicked");
                format!("Error: tool {} panicked: {message}", call.name)
            }
        };
        results.push(result);
    }
    results
}

// ============================================================================
// Tool-call extraction
// ============================================================================

/// Structured tool calls, or ones embedded in the reply text
#[must_use]
pub fn requested_tool_calls(reply: &BackendReply) -> Vec<ToolCall> {
    if reply.tool_calls.is_empty() {
        parse_embedded_tool_calls(&reply.text)
    } else {
        reply.tool_calls.clone()
    }
}

/// Parse `{"tool_calls": [{"name": ..., "arguments": ...}]}` out of reply text
///
/// Accepts raw JSON, a fenced ```json block, or the outermost `{...}` slice.
#[must_use]
pub fn parse_embedded_tool_calls(text: &str) -> Vec<ToolCall> {
    let Some(value) = extract_json(text) else {
        return Vec::new();
    };
    let Some(calls) = value.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };

    calls
        .iter()
        .enumerate()
        .filter_map(|(idx, call)| {
            let call = call.get("function").unwrap_or(call);
            let name = call.get("name")?.as_str()?;
            let arguments = match call.get("arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(other) => other.clone(),
                None => Value::Object(Default::default()),
            };
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| format!("embedded_{idx}"), String::from);
            Some(ToolCall::new(id, name, arguments))
        })
        .collect()
}

fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if !trimmed.contains('{') {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let fenced = &trimmed[start + 3..];
        let fenced = fenced
            .strip_prefix("json")
            .or_else(|| fenced.strip_prefix("JSON"))
            .unwrap_or(fenced);
        if let Some(end) = fenced.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(fenced[..end].trim()) {
                return Some(value);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Some(value);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::convert::Infallible;

    /// Replays scripted replies; repeats the last one forever
    struct Scripted {
        replies: Mutex<Vec<BackendReply>>,
        seen: Mutex<Vec<(usize, bool)>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<BackendReply>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TurnSender for Scripted {
        type Error = Infallible;

        async fn send_turn(
            &self,
            messages: &[ChatMessage],
            tools_enabled: bool,
        ) -> Result<BackendReply, Infallible> {
            self.seen.lock().push((messages.len(), tools_enabled));
            let mut replies = self.replies.lock();
            let reply = if replies.len() > 1 {
                replies.pop().unwrap_or_default()
            } else {
                replies.last().cloned().unwrap_or_default()
            };
            Ok(reply)
        }
    }

    struct Echo;

    #[async_trait]
    impl CapabilityExecutor for Echo {
        async fn execute(&self, tool_name: &str, arguments: &Value) -> Result<String, ToolError> {
            match tool_name {
                "broken" => return Err(ToolError::Failed("disk on fire".into())),
                "explode" => panic!("stack smashed"),
                _ => {}
            }
            Ok(format!("{tool_name}:{arguments}"))
        }
    }

    fn tool_reply() -> BackendReply {
        BackendReply::with_tool_calls("", vec![ToolCall::new("c1", "search", json!({"q": "x"}))])
    }

    fn tool_loop(max_rounds: u32) -> AgenticToolLoop {
        AgenticToolLoop::new(ToolLoopConfig {
            max_rounds,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_plain_answer_finalizes() {
        let sender = Scripted::new(vec![BackendReply::text("done")]);
        let run = tool_loop(3)
            .run(&sender, &Echo, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(run.text, "done");
        assert_eq!(run.backend_calls, 1);
        assert!(!run.forced_final);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let sender = Scripted::new(vec![tool_reply(), BackendReply::text("found it")]);
        let run = tool_loop(3)
            .run(&sender, &Echo, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(run.text, "found it");
        assert_eq!(run.rounds.len(), 1);
        assert_eq!(run.rounds[0].results, vec![r#"search:{"q":"x"}"#.to_string()]);
        // user, assistant(tool call), tool result
        assert_eq!(sender.seen.lock()[1], (3, true));
    }

    #[tokio::test]
    async fn test_always_tool_calling_terminates() {
        let sender = Scripted::new(vec![tool_reply()]);
        let run = tool_loop(3)
            .run(&sender, &Echo, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap();

        assert_eq!(run.backend_calls, 4);
        assert_eq!(run.rounds.len(), 3);
        assert!(run.forced_final);
        assert!(!run.text.is_empty());

        let seen = sender.seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(!seen[3].1, "final request must disable tools");
    }

    #[tokio::test]
    async fn test_first_reply_counts_as_first_round() {
        let sender = Scripted::new(vec![tool_reply()]);
        let run = tool_loop(2)
            .run(
                &sender,
                &Echo,
                vec![ChatMessage::user("hi")],
                Some(tool_reply()),
            )
            .await
            .unwrap();
        // the first reply was supplied, so only the rest hit the sender
        assert_eq!(run.backend_calls, 2);
        assert_eq!(run.rounds.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_rounds_goes_straight_to_final() {
        let sender = Scripted::new(vec![tool_reply(), BackendReply::text("final")]);
        let run = tool_loop(0)
            .run(&sender, &Echo, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(run.backend_calls, 2);
        assert_eq!(run.text, "final");
        assert!(run.rounds.is_empty());
    }

    #[tokio::test]
    async fn test_tool_errors_become_results() {
        let sender = Scripted::new(vec![
            BackendReply::with_tool_calls("", vec![ToolCall::new("c", "broken", json!({}))]),
            BackendReply::text("recovered"),
        ]);
        let run = tool_loop(2)
            .run(&sender, &Echo, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(run.text, "recovered");
        assert_eq!(run.rounds[0].results[0], "Error: tool failed: disk on fire");
    }

    #[tokio::test]
    async fn test_tool_panic_becomes_result() {
        let sender = Scripted::new(vec![
            BackendReply::with_tool_calls(
                "",
                vec![
                    ToolCall::new("a", "explode", json!({})),
                    ToolCall::new("b", "search", json!({"q": 1})),
                ],
            ),
            BackendReply::text("carried on"),
        ]);
        let run = tool_loop(2)
            .run(&sender, &Echo, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(run.text, "carried on");
        assert_eq!(
            run.rounds[0].results,
            vec![
                "Error: tool explode panicked: stack smashed".to_string(),
                r#"search:{"q":1}"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_embedded_tool_calls() {
        let text = "Let me check.\n```json\n{\"tool_calls\": [{\"name\": \"status\", \"arguments\": {\"id\": 3}}]}\n```";
        let calls = parse_embedded_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "status");
        assert_eq!(calls[0].arguments, json!({"id": 3}));

        let raw = r#"{"tool_calls":[{"function":{"name":"read","arguments":"{\"path\":\"a\"}"}}]}"#;
        let calls = parse_embedded_tool_calls(raw);
        assert_eq!(calls[0].name, "read");
        assert_eq!(calls[0].arguments, json!({"path": "a"}));

        assert!(parse_embedded_tool_calls("just words").is_empty());
        assert!(parse_embedded_tool_calls(r#"{"answer": 1}"#).is_empty());
    }
}
