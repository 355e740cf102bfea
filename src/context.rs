//! `ContextStore`: per-sender bounded conversation history with
//! LLM-assisted summarization when the token budget is exceeded
//! (SPEC_FULL.md §4.4). Stored under `ctx:<sender>`, TTL 4 hours, extended
//! on every write.

use crate::error::Result;
use crate::kv::Store;
use crate::types::{ConversationMessage, Role};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tiktoken_rs::CoreBPE;

/// A single oversized message is replaced with this envelope rather than
/// stored verbatim (SPEC_FULL.md §4.4's input guard).
pub const MAX_CONTENT_SIZE: usize = 15 * 1024;
/// Token budget enforced after every write.
pub const MAX_TOKENS: usize = 2500;
/// Target the backward walk trims down to before re-checking the budget.
pub const TARGET_TOKENS: usize = 1500;
/// TTL refreshed on every append.
pub const HISTORY_TTL_SECS: usize = 4 * 3600;

fn tokenizer() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer data"))
}

/// Summarizes the pre-split slice of a sender's history into a compact
/// note preserving names, identifiers, and the last request's status.
/// Implemented by [`crate::llm::LlmClient`]; tests substitute a fake that
/// returns a canned string or fails, to exercise the "summarization
/// failure" fallback.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[ConversationMessage]) -> Result<String>;
}

/// Token cost of one stored message: tokenizer count over content and any
/// tool-call JSON, plus a flat 4-token metadata overhead per SPEC_FULL.md
/// §4.4.
pub fn message_tokens(message: &ConversationMessage) -> usize {
    let bpe = tokenizer();
    let mut total = 4;
    if let Some(content) = &message.content {
        total += bpe.encode_ordinary(content).len();
    }
    if let Some(tool_calls) = &message.tool_calls {
        if let Ok(json) = serde_json::to_string(tool_calls) {
            total += bpe.encode_ordinary(&json).len();
        }
    }
    total
}

pub fn total_tokens(messages: &[ConversationMessage]) -> usize {
    messages.iter().map(message_tokens).sum()
}

/// Walks `messages` backwards (newest to oldest) summing tokens; returns
/// the index of the oldest message to keep such that `messages[split..]`
/// is at or under `TARGET_TOKENS`. A return value < 2 signals the
/// indivisible case (not enough separation to summarize usefully).
pub fn find_split(messages: &[ConversationMessage]) -> usize {
    let mut running = 0usize;
    for i in (0..messages.len()).rev() {
        running += message_tokens(&messages[i]);
        if running > TARGET_TOKENS {
            return i + 1;
        }
    }
    0
}

/// Applies the oversized-content guard to a single message in place:
/// content over `MAX_CONTENT_SIZE` bytes is replaced with a summary
/// envelope carrying a system note and a 1000-character preview.
pub fn apply_content_guard(message: &mut ConversationMessage) {
    let Some(content) = &message.content else { return };
    if content.len() <= MAX_CONTENT_SIZE {
        return;
    }
    let envelope = json!({
        "system_note": "content truncated: exceeded maximum stored size",
        "preview": crate::utils::preview(content, 1000),
    });
    message.content = Some(envelope.to_string());
}

pub struct ContextStore {
    store: Arc<dyn Store>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextStore {
    pub fn new(store: Arc<dyn Store>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { store, summarizer }
    }

    fn key(sender: &str) -> String {
        format!("ctx:{sender}")
    }

    /// Returns the whole history for `sender`, oldest message first.
    pub async fn get(&self, sender: &str) -> Result<Vec<ConversationMessage>> {
        let raw = self.store.list_get_all(&Self::key(sender)).await?;
        Ok(raw.iter().filter_map(|entry| serde_json::from_str(entry).ok()).collect())
    }

    /// Appends one message, applying the content guard, refreshing the
    /// TTL, then enforcing the token budget. Returns the post-write history.
    pub async fn append(
        &self,
        sender: &str,
        mut message: ConversationMessage,
    ) -> Result<Vec<ConversationMessage>> {
        apply_content_guard(&mut message);

        let key = Self::key(sender);
        let payload = serde_json::to_string(&message)?;
        self.store.list_push_right(&key, &payload).await?;
        self.store.expire(&key, HISTORY_TTL_SECS).await?;

        let history = self.get(sender).await?;
        self.enforce_budget(sender, history).await
    }

    /// Enforces `MAX_TOKENS` on an already-loaded history, writing back a
    /// compacted list when necessary and returning the (possibly
    /// unchanged) result.
    async fn enforce_budget(
        &self,
        sender: &str,
        messages: Vec<ConversationMessage>,
    ) -> Result<Vec<ConversationMessage>> {
        if total_tokens(&messages) <= MAX_TOKENS {
            return Ok(messages);
        }

        let split = find_split(&messages);
        if split < 2 {
            let mut trimmed = messages;
            if !trimmed.is_empty() {
                trimmed.remove(0);
            }
            self.write_back(sender, &trimmed).await?;
            return Ok(trimmed);
        }

        let pre_split = &messages[..split];
        let compacted = match self.summarizer.summarize(pre_split).await {
            Ok(summary) => {
                let note = ConversationMessage::system(
                    format!("SAŽETAK RANIJEG RAZGOVORA: {summary}"),
                    crate::utils::now_millis(),
                );
                let mut result = vec![note];
                result.extend_from_slice(&messages[split..]);
                result
            }
            Err(_) => messages[split..].to_vec(),
        };
        self.write_back(sender, &compacted).await?;
        Ok(compacted)
    }

    async fn write_back(&self, sender: &str, messages: &[ConversationMessage]) -> Result<()> {
        let payloads: Vec<String> =
            messages.iter().filter_map(|m| serde_json::to_string(m).ok()).collect();
        self.store.list_replace(&Self::key(sender), &payloads, HISTORY_TTL_SECS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_summary_system_message(message: &ConversationMessage) -> bool {
        message.role == Role::System
            && message
                .content
                .as_deref()
                .is_some_and(|c| c.starts_with("SAŽETAK RANIJEG RAZGOVORA:"))
    }

    fn msg(role: Role, content: &str, tokens_hint: usize) -> ConversationMessage {
        // Pad content so the tokenizer produces roughly `tokens_hint` tokens
        // (English words average ~1.3 tokens each under cl100k).
        let body = "word ".repeat(tokens_hint);
        let _ = content;
        ConversationMessage { role, content: Some(body), tool_calls: None, tool_call_id: None, name: None, timestamp: 0 }
    }

    #[test]
    fn total_tokens_sums_overhead_and_content() {
        let messages = vec![msg(Role::User, "hi", 1)];
        assert!(total_tokens(&messages) >= 4);
    }

    #[test]
    fn find_split_is_indivisible_for_tiny_history() {
        let messages = vec![msg(Role::User, "hi", 1)];
        assert!(find_split(&messages) < 2);
    }

    #[test]
    fn find_split_keeps_recent_messages_under_target() {
        // 40 messages of ~120 tokens each: plenty of separation to split.
        let messages: Vec<_> = (0..40).map(|_| msg(Role::User, "x", 120)).collect();
        let split = find_split(&messages);
        assert!(split >= 2);
        let kept_tokens = total_tokens(&messages[split..]);
        assert!(kept_tokens <= TARGET_TOKENS);
    }

    #[test]
    fn content_guard_replaces_oversized_content() {
        let mut message = ConversationMessage::user("x".repeat(MAX_CONTENT_SIZE + 1), 0);
        apply_content_guard(&mut message);
        let content = message.content.unwrap();
        assert!(content.contains("system_note"));
        assert!(content.contains("preview"));
        assert!(content.len() < MAX_CONTENT_SIZE);
    }

    #[test]
    fn content_guard_leaves_small_content_untouched() {
        let mut message = ConversationMessage::user("hello", 0);
        apply_content_guard(&mut message);
        assert_eq!(message.content.as_deref(), Some("hello"));
    }

    #[test]
    fn summary_message_is_recognized_by_prefix() {
        let summary = ConversationMessage::system("SAŽETAK RANIJEG RAZGOVORA: ...", 0);
        assert!(is_summary_system_message(&summary));
        let other = ConversationMessage::system("unrelated", 0);
        assert!(!is_summary_system_message(&other));
    }
}
