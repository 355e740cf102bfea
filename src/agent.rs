//! `AgentLoop`: the bounded plan/act/observe iteration that turns one
//! inbound user message into zero or more tool calls and a reply
//! (SPEC_FULL.md §4.5). Coordinates `ContextStore`, `ToolRegistry`, the
//! LLM (through the [`Planner`] seam), and `ToolGateway`.

use crate::context::ContextStore;
use crate::error::Result;
use crate::gateway::ToolExecutor;
use crate::registry::{DEFAULT_TOP_K, ToolRegistry};
use crate::types::{ConversationMessage, LlmDecision, PlannedToolCall, Role, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on plan/act/observe iterations for a single inbound turn.
pub const MAX_STEPS: usize = 3;

const TOO_COMPLEX_FALLBACK: &str = "Request too complex; please simplify.";

/// System prompt establishing persona, the read/write confirmation gate,
/// and the instruction to relay (not swallow) tool errors.
pub const SYSTEM_PROMPT: &str = "You are the virtual assistant for the mobility service's chat channel. \
Be brief and direct in your replies. Read-only operations may be executed immediately. \
Any operation that changes state must first be described back to the user in plain language, \
and may only be executed after the user explicitly confirms it in a following message. \
If a tool call fails, tell the user it failed instead of hiding the failure.";

/// Authenticated caller identity, resolved upstream (out of scope here)
/// and passed in so `AgentLoop` can bind it into every tool call.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
}

/// Seam over the LLM's decision contract (`analyze_intent` in
/// SPEC_FULL.md §4.5). Implemented by [`crate::llm::LlmClient`]; tests
/// substitute a fake returning canned decisions so the loop's branching
/// can be exercised without a live LLM.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn decide(
        &self,
        history: &[ConversationMessage],
        user_text: Option<&str>,
        tools: Option<&[Value]>,
        system_instruction: Option<&str>,
    ) -> Result<LlmDecision>;
}

/// Finds the content of the most recent `user`-role message, used as the
/// retrieval query for steps after the first (where there's no fresh
/// `user_text`, only the tool result just observed).
fn most_recent_user_content(history: &[ConversationMessage]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.clone())
}

fn identity_instruction(identity: Option<&Identity>) -> Option<String> {
    identity.map(|id| {
        format!(
            "The authenticated user's internal identifier is `{}`. Every tool call you emit must \
             carry this value in its `User` (or `email`) parameter; never ask the user for it.",
            id.user_id
        )
    })
}

pub struct AgentLoop {
    context: Arc<ContextStore>,
    registry: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
    gateway: Arc<dyn ToolExecutor>,
}

impl AgentLoop {
    pub fn new(
        context: Arc<ContextStore>,
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
        gateway: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self { context, registry, planner, gateway }
    }

    /// Runs the bounded loop for one inbound turn, returning the reply text
    /// that the caller should enqueue outbound. The reply (and every
    /// intermediate tool call/result) is appended to `sender`'s context as
    /// it happens, so a crash mid-loop leaves a consistent partial history
    /// rather than losing the turn silently.
    pub async fn handle_turn(
        &self,
        sender: &str,
        text: &str,
        identity: Option<&Identity>,
    ) -> Result<String> {
        self.context.append(sender, ConversationMessage::user(text, crate::utils::now_millis())).await?;

        let identity_instruction = identity_instruction(identity);
        let mut user_text = Some(text.to_string());

        for _step in 0..MAX_STEPS {
            let history = self.context.get(sender).await?;
            let search_query = user_text.clone().or_else(|| most_recent_user_content(&history));

            let tools = match &search_query {
                Some(query) => Some(self.registry.find_relevant_tools(query, DEFAULT_TOP_K).await?),
                None => None,
            };

            let decision = self
                .planner
                .decide(&history, user_text.as_deref(), tools.as_deref(), identity_instruction.as_deref())
                .await?;

            let Some(planned) = decision.tool_call else {
                let reply = decision.response_text.unwrap_or_default();
                self.context
                    .append(sender, ConversationMessage::assistant_text(reply.clone(), crate::utils::now_millis()))
                    .await?;
                return Ok(reply);
            };

            self.context
                .append(
                    sender,
                    ConversationMessage::assistant_tool_calls(planned.raw_tool_calls.clone(), crate::utils::now_millis()),
                )
                .await?;

            let result = match self.registry.get(&planned.operation_id) {
                Some(tool_def) => self.gateway.execute(&tool_def, planned.parameters.clone()).await?,
                None => ToolResult::error(format!("unknown tool: {}", planned.operation_id)),
            };
            self.append_tool_result(sender, &planned, &result).await?;

            user_text = None;
        }

        self.context
            .append(sender, ConversationMessage::assistant_text(TOO_COMPLEX_FALLBACK, crate::utils::now_millis()))
            .await?;
        Ok(TOO_COMPLEX_FALLBACK.to_string())
    }

    async fn append_tool_result(&self, sender: &str, planned: &PlannedToolCall, result: &ToolResult) -> Result<()> {
        let content = serde_json::to_string(result)?;
        self.context
            .append(
                sender,
                ConversationMessage::tool_result(
                    planned.tool_call_id.clone(),
                    planned.operation_id.clone(),
                    content,
                    crate::utils::now_millis(),
                ),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> ConversationMessage {
        ConversationMessage { role, content: Some(content.to_string()), tool_calls: None, tool_call_id: None, name: None, timestamp: 0 }
    }

    #[test]
    fn most_recent_user_content_finds_last_user_message() {
        let history = vec![msg(Role::User, "first"), msg(Role::Assistant, "reply"), msg(Role::User, "second")];
        assert_eq!(most_recent_user_content(&history), Some("second".to_string()));
    }

    #[test]
    fn most_recent_user_content_is_none_without_user_messages() {
        let history = vec![msg(Role::System, "setup")];
        assert_eq!(most_recent_user_content(&history), None);
    }

    #[test]
    fn identity_instruction_is_none_when_unauthenticated() {
        assert_eq!(identity_instruction(None), None);
    }

    #[test]
    fn identity_instruction_embeds_user_id() {
        let identity = Identity { user_id: "u-42".to_string() };
        let instruction = identity_instruction(Some(&identity)).unwrap();
        assert!(instruction.contains("u-42"));
    }
}
