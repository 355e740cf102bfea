//! Wire and storage types shared by every component: the KV-store payloads
//! described in the data model, and the OpenAI-shaped structures used to
//! talk to the LLM and to describe tools.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A message pulled off the inbound stream, produced by the (out-of-scope)
/// webhook receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: i64,
}

/// A message waiting to be sent (or retried) through the chat-gateway send
/// API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub text: String,
    pub cid: String,
    #[serde(default)]
    pub attempts: u32,
}

impl OutboundMessage {
    /// Builds a fresh outbound message, generating a correlation id.
    pub fn new(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: text.into(),
            cid: Uuid::new_v4().to_string(),
            attempts: 0,
        }
    }
}

/// A payload parked in a dead-letter list, tagged with why it landed there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry<T> {
    #[serde(flatten)]
    pub payload: T,
    pub error: String,
    pub failed_at: i64,
}

/// Role of a [`ConversationMessage`] in a per-sender history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of a stored conversation. Mirrors the OpenAI chat message shape
/// closely enough to pass straight through to [`crate::llm`] without
/// translation; `content` is `None` only for an assistant message carrying
/// `tool_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub timestamp: i64,
}

impl ConversationMessage {
    pub fn system(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp,
        }
    }

    pub fn user(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp,
        }
    }

    pub fn assistant_text(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>, timestamp: i64) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
            timestamp,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            timestamp,
        }
    }
}

/// A single tool invocation requested by the model, OpenAI's `tool_calls`
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Raw JSON-encoded arguments string, as the API sends it — parsed by
    /// the caller rather than here so a parse failure can drive the
    /// malformed-JSON retry path in [`crate::agent`].
    pub arguments: String,
}

/// A tool available to the LLM, derived from one OpenAPI operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub operation_id: String,
    pub http_method: HttpMethod,
    pub path_template: String,
    /// JSON Schema for the tool's parameters, as passed to the LLM's
    /// `tools` field.
    pub llm_schema: Value,
    /// L2-normalized embedding vector for semantic retrieval.
    pub embedding_vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn from_openapi_key(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "get" => Some(HttpMethod::Get),
            "post" => Some(HttpMethod::Post),
            "put" => Some(HttpMethod::Put),
            "delete" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Outcome of a single `AgentLoop` decision step, the return shape of
/// `LLM.decide` in SPEC_FULL.md §4.5.
#[derive(Debug, Clone)]
pub struct LlmDecision {
    pub tool_call: Option<PlannedToolCall>,
    pub response_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlannedToolCall {
    pub tool_call_id: String,
    pub operation_id: String,
    pub parameters: Value,
    pub raw_tool_calls: Vec<ToolCall>,
}

/// Outcome returned by [`crate::gateway::ToolGateway::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    Success { status: String, data: Option<Value> },
    Error { error: bool, status: Option<u16>, message: String },
}

impl ToolResult {
    pub fn success(data: Option<Value>) -> Self {
        ToolResult::Success { status: "success".to_string(), data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolResult::Error { error: true, status: None, message: message.into() }
    }

    pub fn error_with_status(status: u16, message: impl Into<String>) -> Self {
        ToolResult::Error { error: true, status: Some(status), message: message.into() }
    }
}
