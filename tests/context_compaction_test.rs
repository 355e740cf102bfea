//! Exercises `ContextStore`'s token-budget enforcement: enough history
//! accumulates that the oldest portion gets summarized into a single
//! system message rather than kept verbatim.

mod common;

use common::{FakeStore, FakeSummarizer};
use mobility_agent::context::{total_tokens, ContextStore, MAX_TOKENS};
use mobility_agent::types::{ConversationMessage, Role};
use std::sync::Arc;

#[tokio::test]
async fn thirty_turn_pairs_compact_into_a_summary_message() {
    let store = Arc::new(FakeStore::new());
    let summarizer = Arc::new(FakeSummarizer::new("Customer asked about vehicle ZG1234AB three times."));
    let context = ContextStore::new(store, summarizer);
    let sender = "385000000";

    // Padded heavily so the 2500-token budget is crossed well before all 30
    // pairs are appended, exercising the compaction path repeatedly.
    let padded = |prefix: &str, n: usize| format!("{prefix} {}", "word ".repeat(n));

    let mut last_history = Vec::new();
    for i in 0..30 {
        context.append(sender, ConversationMessage::user(padded("request", 150), 0)).await.unwrap();
        last_history = context
            .append(sender, ConversationMessage::assistant_text(padded(&format!("reply-{i}"), 150), 0))
            .await
            .unwrap();
    }

    assert!(last_history.len() < 60, "history should have been compacted below the raw 60-message count");
    assert_eq!(last_history[0].role, Role::System);
    assert!(
        last_history[0].content.as_deref().unwrap().starts_with("SAŽETAK RANIJEG RAZGOVORA:"),
        "oldest retained message should be the summarization envelope"
    );
    assert!(total_tokens(&last_history) <= MAX_TOKENS + 500, "compaction should bring the history back near budget");
}

#[tokio::test]
async fn summarizer_failure_falls_back_to_a_hard_trim() {
    let store = Arc::new(FakeStore::new());
    let summarizer = Arc::new(FakeSummarizer::failing_once("unused"));
    let context = ContextStore::new(store, summarizer);
    let sender = "385000001";

    // Large enough that the budget is crossed well within a handful of
    // appends; stop at the first compaction event so the one scripted
    // summarizer failure is the one under test, not masked by a later
    // successful compaction.
    let mut history = Vec::new();
    for i in 0..20 {
        history = context
            .append(sender, ConversationMessage::user(format!("msg {i} {}", "word ".repeat(300)), 0))
            .await
            .unwrap();
        if history.len() < i + 1 {
            break;
        }
    }

    assert!(!history.is_empty());
    assert_ne!(history[0].role, Role::System, "a failed summarization must not leave a summary envelope behind");
}
