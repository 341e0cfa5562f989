//! Ollama Invoker
//!
//! Text and agentic invoker for an Ollama server (or any proxy speaking its
//! chat API).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history and tools
//! - `/api/tags` - List available models
//!
//! HTTP failures are mapped onto the backend error taxonomy: 429 is a rate
//! limit (honouring `Retry-After`), 5xx is unavailability, 400/422 are
//! malformed requests, 401/403 are auth failures, 404 is an unknown model.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::traits::{BackendError, BackendInvoker, BackendReply, InvokeRequest};
use crate::conversation::{ChatMessage, MessageRole, ToolCall};

/// Ollama chat invoker
#[derive(Clone)]
pub struct OllamaInvoker {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaInvoker {
    /// Create a new Ollama invoker
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            host: host.into(),
            port,
            http_client,
        }
    }

    /// Create from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self::new(host, port)
    }

    /// Get the base URL
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Check whether the server answers
    pub async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    /// Names of the models the server has pulled
    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body, None));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("invalid tags response: {e}")))?;

        Ok(data
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name")?.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl Default for OllamaInvoker {
    fn default() -> Self {
        Self::new("localhost", 11434)
    }
}

// ============================================================================
// Wire Format
// ============================================================================

fn message_to_wire(message: &ChatMessage) -> Value {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if let Some(name) = &message.tool_name {
        wire["tool_name"] = Value::String(name.clone());
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = Value::String(id.clone());
    }
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "function": { "name": call.name, "arguments": call.arguments }
                    })
                })
                .collect(),
        );
    }
    wire
}

/// Build the `/api/chat` request body
pub(crate) fn build_chat_body(request: &InvokeRequest) -> Value {
    let mut messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();

    if !request.files.is_empty() {
        let listing = request
            .files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(json!({
            "role": MessageRole::User.as_str(),
            "content": format!("Attached files:\n{listing}"),
        }));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": false,
    });

    if request.tools_enabled && !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        );
    }

    if let Some(schema) = &request.schema {
        body["format"] = schema.clone();
    }

    if request.max_tokens > 0 {
        body["options"] = json!({ "num_predict": request.max_tokens });
    }

    body
}

/// Parse a `/api/chat` response body
pub(crate) fn parse_chat_reply(data: &Value) -> BackendReply {
    let message = data.get("message");

    let text = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map_or_else(|| format!("call_{idx}"), String::from);
                    Some(ToolCall::new(id, name, arguments))
                })
                .collect()
        })
        .unwrap_or_default();

    let tokens_used = data
        .get("eval_count")
        .and_then(Value::as_u64)
        .map(|c| u32::try_from(c).unwrap_or(u32::MAX));

    BackendReply {
        text,
        tool_calls,
        tokens_used,
    }
}

/// `Retry-After` in milliseconds (seconds form only)
fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(Duration::ZERO)
    } else if e.is_connect() {
        BackendError::Connection(e.to_string())
    } else if e.is_builder() {
        BackendError::MalformedRequest(e.to_string())
    } else {
        BackendError::Connection(e.to_string())
    }
}

#[async_trait]
impl BackendInvoker for OllamaInvoker {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<BackendReply, BackendError> {
        let body = build_chat_body(request);

        let mut http = self.http_client.post(self.chat_url()).json(&body);
        if let Some(credential) = &request.credential {
            http = http.bearer_auth(credential.secret());
        }

        let response = http.send().await.map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body, retry_after));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("invalid chat response: {e}")))?;

        Ok(parse_chat_reply(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ToolSpec;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ollama_invoker_creation() {
        let invoker = OllamaInvoker::new("localhost", 11434);
        assert_eq!(invoker.base_url(), "http://localhost:11434");
        assert_eq!(invoker.chat_url(), "http://localhost:11434/api/chat");

        let invoker = OllamaInvoker::new("https://llm.internal/", 443);
        assert_eq!(invoker.base_url(), "https://llm.internal:443");
    }

    #[test]
    fn test_chat_body() {
        let request = InvokeRequest::new(
            2,
            "llama3",
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
        );
        let mut request = request.with_tools(vec![ToolSpec::new(
            "search",
            "web search",
            json!({"type": "object"}),
        )]);
        request.max_tokens = 64;

        let body = build_chat_body(&request);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["options"]["num_predict"], 64);
        assert!(body.get("format").is_none());
    }

    #[test]
    fn test_tools_omitted_when_disabled() {
        let mut request = InvokeRequest::new(2, "llama3", vec![ChatMessage::user("hi")])
            .with_tools(vec![ToolSpec::new("search", "", Value::Null)]);
        request.tools_enabled = false;
        request.files = vec!["notes.txt".to_string()];

        let body = build_chat_body(&request);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][1]["content"], "Attached files:\n- notes.txt");
    }

    #[test]
    fn test_parse_reply() {
        let data = json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "lookup", "arguments": {"id": 7}}}
                ]
            },
            "eval_count": 12
        });
        let reply = parse_chat_reply(&data);
        assert_eq!(reply.text, "");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].id, "call_0");
        assert_eq!(reply.tool_calls[0].arguments, json!({"id": 7}));
        assert_eq!(reply.tokens_used, Some(12));
    }

    #[test]
    fn test_tool_results_name_their_call() {
        let call = ToolCall::new("c7", "lookup", json!({"id": 7}));
        let request = InvokeRequest::new(
            5,
            "llama3",
            vec![
                ChatMessage::user("find 7"),
                ChatMessage::assistant_with_calls("", vec![call.clone()]),
                ChatMessage::tool_result(&call, "seven"),
            ],
        );

        let body = build_chat_body(&request);
        assert_eq!(body["messages"][1]["tool_calls"][0]["id"], "c7");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_name"], "lookup");
        assert_eq!(body["messages"][2]["tool_call_id"], "c7");
        assert!(body["messages"][0].get("tool_name").is_none());
    }

    #[test]
    fn test_oversized_token_count_saturates() {
        let data = json!({
            "message": {"role": "assistant", "content": "ok"},
            "eval_count": u64::from(u32::MAX) + 5
        });
        assert_eq!(parse_chat_reply(&data).tokens_used, Some(u32::MAX));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), None);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("3"),
        );
        assert_eq!(retry_after_ms(&headers), Some(3000));
    }
}
