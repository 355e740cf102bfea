//! Thin client for the two LLM surfaces the core depends on: chat
//! completion (used by the agent loop and by context summarization) and
//! embeddings (used by the tool registry). Non-streaming — the agent loop
//! needs the whole decision before it can act, unlike the teacher SDK's
//! token-by-token `query()`, so requests are sent with `stream: false` and
//! the full JSON body is read back in one shot.

use crate::agent::Planner;
use crate::context::Summarizer;
use crate::error::{Error, Result};
use crate::registry::Embedder;
use crate::types::{ConversationMessage, LlmDecision, PlannedToolCall, ToolCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Hard timeout for a chat completion call (SPEC_FULL.md §5).
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Hard timeout for an embedding call.
pub const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire shape of one message in a chat completion request, mirroring the
/// teacher's `OpenAIMessage` but widened to carry tool calls and tool
/// results verbatim rather than flattening everything to a content string.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    /// Converts a stored [`ConversationMessage`] straight through — the
    /// stored shape already mirrors the wire shape closely enough that no
    /// translation is needed beyond the enum-to-string role conversion.
    pub fn from_stored(message: &ConversationMessage) -> Self {
        let role = match message.role {
            crate::types::Role::System => "system",
            crate::types::Role::User => "user",
            crate::types::Role::Assistant => "assistant",
            crate::types::Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            name: message.name.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Outcome of a raw chat completion call: the model either asked to call
/// tools or produced a text reply. The upstream API contract guarantees
/// exactly one of these per response.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    ToolCalls(Vec<ToolCall>),
    Text(String),
}

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Issues a non-streaming chat completion. `tool_choice` is set to
    /// `"auto"` whenever `tools` is non-empty, per SPEC_FULL.md §4.5.
    pub async fn chat(
        &self,
        messages: Vec<WireMessage>,
        tools: Option<Vec<Value>>,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<ChatOutcome> {
        let tool_choice = tools.as_ref().filter(|t| !t.is_empty()).map(|_| "auto");
        let request = ChatRequest { model: self.model.clone(), messages, temperature, max_tokens, tools, tool_choice };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(CHAT_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status, format!("chat completion failed: {body}")));
        }

        let parsed: ChatResponse = response.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm("empty choices array"))?
            .message;

        match message.tool_calls {
            Some(calls) if !calls.is_empty() => Ok(ChatOutcome::ToolCalls(calls)),
            _ => Ok(ChatOutcome::Text(message.content.unwrap_or_default())),
        }
    }
}

#[async_trait]
impl Embedder for LlmClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(EMBED_TIMEOUT)
            .json(&serde_json::json!({ "model": "text-embedding-3-small", "input": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status, format!("embedding request failed: {body}")));
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.pop().map(|d| d.embedding).ok_or_else(|| Error::llm("empty embedding data"))
    }
}

const SUMMARIZER_PROMPT: &str = "Sažmi prethodni razgovor u kratak zapis, čuvajući imena, identifikatore, \
registarske oznake, koordinate i status zadnjeg zahtjeva. Budi sažet, najviše nekoliko rečenica.";

#[async_trait]
impl Summarizer for LlmClient {
    async fn summarize(&self, messages: &[ConversationMessage]) -> Result<String> {
        let mut wire = vec![WireMessage::system(SUMMARIZER_PROMPT)];
        wire.extend(messages.iter().map(WireMessage::from_stored));

        match self.chat(wire, None, 0.0, Some(200)).await? {
            ChatOutcome::Text(text) => Ok(text),
            ChatOutcome::ToolCalls(_) => Err(Error::llm("summarizer unexpectedly returned tool calls")),
        }
    }
}

/// Returned once malformed tool-call JSON survives a retry (SPEC_FULL.md
/// §4.5: "total attempts ≤ 2").
const MALFORMED_JSON_FALLBACK: &str = "Tehnička greška u formatu podataka.";
/// Returned when the chat completion call itself fails (timeout,
/// transport, 5xx) — the turn degrades to an apology rather than
/// propagating the error up through the agent loop.
const LLM_UNAVAILABLE_FALLBACK: &str = "Isprike, sustav je trenutno nedostupan zbog tehničke greške.";

fn fallback_decision(text: &str) -> LlmDecision {
    LlmDecision { tool_call: None, response_text: Some(text.to_string()) }
}

#[async_trait]
impl Planner for LlmClient {
    /// Implements the LLM decision contract: assembles
    /// `[system-prompt, identity-instruction?, *history, user?]`, sets
    /// `tool_choice="auto"` whenever tools are offered, and runs at
    /// temperature 0 for deterministic tool selection. A malformed tool
    /// call's JSON arguments trigger one re-invocation before falling back
    /// to a fixed apology; any other failure of the call itself degrades
    /// to a different fixed apology without propagating.
    async fn decide(
        &self,
        history: &[ConversationMessage],
        user_text: Option<&str>,
        tools: Option<&[Value]>,
        system_instruction: Option<&str>,
    ) -> Result<LlmDecision> {
        let mut messages = vec![WireMessage::system(crate::agent::SYSTEM_PROMPT)];
        if let Some(instruction) = system_instruction {
            messages.push(WireMessage::system(instruction));
        }
        messages.extend(history.iter().map(WireMessage::from_stored));
        if let Some(text) = user_text {
            messages.push(WireMessage::user(text));
        }

        let tools_vec = tools.map(<[Value]>::to_vec);

        for attempt in 0..2 {
            let outcome = match self.chat(messages.clone(), tools_vec.clone(), 0.0, None).await {
                Ok(outcome) => outcome,
                Err(_) => return Ok(fallback_decision(LLM_UNAVAILABLE_FALLBACK)),
            };

            match outcome {
                ChatOutcome::Text(text) => return Ok(LlmDecision { tool_call: None, response_text: Some(text) }),
                ChatOutcome::ToolCalls(calls) => {
                    let Some(first) = calls.first() else {
                        return Ok(fallback_decision(MALFORMED_JSON_FALLBACK));
                    };
                    match serde_json::from_str::<Value>(&first.function.arguments) {
                        Ok(parameters) => {
                            return Ok(LlmDecision {
                                tool_call: Some(PlannedToolCall {
                                    tool_call_id: first.id.clone(),
                                    operation_id: first.function.name.clone(),
                                    parameters,
                                    raw_tool_calls: calls,
                                }),
                                response_text: None,
                            });
                        }
                        Err(_) if attempt == 0 => continue,
                        Err(_) => return Ok(fallback_decision(MALFORMED_JSON_FALLBACK)),
                    }
                }
            }
        }

        unreachable!("loop always returns within two attempts")
    }
}
