//! Shared fakes for integration tests: an in-memory `Store` plus fake
//! implementations of every collaborator seam (`Planner`, `Embedder`,
//! `Summarizer`, `ChatSender`, `ToolExecutor`). None of this talks to a
//! network or a real Redis — it exists so the worker/agent pipelines can be
//! driven end to end from a `#[tokio::test]`.

#![allow(dead_code)]

use async_trait::async_trait;
use mobility_agent::agent::{Identity, Planner};
use mobility_agent::chat::ChatSender;
use mobility_agent::context::Summarizer;
use mobility_agent::error::{Error, Result};
use mobility_agent::gateway::ToolExecutor;
use mobility_agent::kv::{Store, StreamEntry};
use mobility_agent::registry::Embedder;
use mobility_agent::types::{ConversationMessage, LlmDecision, OutboundMessage, ToolDefinition, ToolResult};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// In-memory stand-in for `RedisStore`. Each keyspace is a plain collection
/// guarded by one mutex; good enough for single-process tests where there's
/// no real concurrency to race against.
#[derive(Default)]
struct FakeStoreState {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(String, i64)>>,
    streams: HashMap<String, VecDeque<(String, String)>>,
    groups: HashSet<String>,
    next_stream_id: u64,
}

pub struct FakeStore {
    state: Mutex<FakeStoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(FakeStoreState::default()) }
    }

    /// Number of entries currently parked on `dlq:inbound` / `dlq:outbound`.
    pub fn list_len(&self, key: &str) -> usize {
        self.state.lock().unwrap().lists.get(key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn zset_scores(&self, key: &str) -> Vec<i64> {
        self.state.lock().unwrap().zsets.get(key).map(|s| s.iter().map(|(_, score)| *score).collect()).unwrap_or_default()
    }
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().strings.get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str, _ttl_secs: Option<usize>) -> Result<()> {
        self.state.lock().unwrap().strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let current: i64 = state.strings.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + 1;
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, _key: &str, _ttl_secs: usize) -> Result<()> {
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, _ttl_ms: usize) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.strings.contains_key(key) {
            Ok(false)
        } else {
            state.strings.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn delete_if_matches(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.strings.get(key).map(String::as_str) == Some(value) {
            state.strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_push_right(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().unwrap().lists.entry(key.to_string()).or_default().push_back(value.to_string());
        Ok(())
    }

    async fn list_pop_left_blocking(&self, key: &str, _timeout_secs: f64) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn list_get_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().lists.get(key).cloned().unwrap_or_default().into_iter().collect())
    }

    async fn list_replace(&self, key: &str, values: &[String], _ttl_secs: usize) -> Result<()> {
        self.state.lock().unwrap().lists.insert(key.to_string(), values.iter().cloned().collect());
        Ok(())
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let set = state.zsets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        Ok(())
    }

    async fn zset_pop_due(&self, key: &str, max_score: i64) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        let Some(set) = state.zsets.get_mut(key) else { return Ok(None) };
        let mut best: Option<(usize, i64)> = None;
        for (i, (_, score)) in set.iter().enumerate() {
            let better = match best {
                Some((_, best_score)) => *score < best_score,
                None => true,
            };
            if *score <= max_score && better {
                best = Some((i, *score));
            }
        }
        Ok(best.map(|(i, _)| set.remove(i).0))
    }

    async fn stream_ensure_group(&self, key: &str, group: &str) -> Result<()> {
        self.state.lock().unwrap().groups.insert(format!("{key}:{group}"));
        Ok(())
    }

    async fn stream_add(&self, key: &str, payload: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_stream_id += 1;
        let id = format!("{}-0", state.next_stream_id);
        state.streams.entry(key.to_string()).or_default().push_back((id.clone(), payload.to_string()));
        Ok(id)
    }

    async fn stream_read_group(
        &self,
        key: &str,
        _group: &str,
        _consumer: &str,
        count: usize,
        _block_ms: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.streams.get_mut(key) else { return Ok(Vec::new()) };
        let mut entries = Vec::new();
        for _ in 0..count {
            let Some((id, payload)) = queue.pop_front() else { break };
            entries.push(StreamEntry { id, payload });
        }
        Ok(entries)
    }

    async fn stream_ack_del(&self, _key: &str, _group: &str, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Returns pre-programmed decisions in order, erroring once exhausted so a
/// test that under-counts its script fails loudly instead of hanging.
pub struct ScriptedPlanner {
    decisions: Mutex<VecDeque<LlmDecision>>,
}

impl ScriptedPlanner {
    pub fn new(decisions: Vec<LlmDecision>) -> Self {
        Self { decisions: Mutex::new(decisions.into()) }
    }

    pub fn reply(text: impl Into<String>) -> LlmDecision {
        LlmDecision { tool_call: None, response_text: Some(text.into()) }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn decide(
        &self,
        _history: &[ConversationMessage],
        _user_text: Option<&str>,
        _tools: Option<&[Value]>,
        _system_instruction: Option<&str>,
    ) -> Result<LlmDecision> {
        self.decisions.lock().unwrap().pop_front().ok_or_else(|| Error::other("ScriptedPlanner script exhausted"))
    }
}

/// Deterministic embedder: hashes the text into a small bag-of-words vector
/// over a fixed keyword set, so cosine similarity in the registry behaves
/// predictably without calling a real embeddings API.
pub struct FakeEmbedder {
    vocabulary: Vec<&'static str>,
}

impl FakeEmbedder {
    pub fn new(vocabulary: Vec<&'static str>) -> Self {
        Self { vocabulary }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        Ok(self.vocabulary.iter().map(|word| if lowered.contains(word) { 1.0 } else { 0.0 }).collect())
    }
}

/// Always returns a fixed summary, unless told to fail once to exercise the
/// "summarization failed, fall back to a hard trim" branch.
pub struct FakeSummarizer {
    fail_once: std::sync::atomic::AtomicBool,
    summary: String,
}

impl FakeSummarizer {
    pub fn new(summary: impl Into<String>) -> Self {
        Self { fail_once: std::sync::atomic::AtomicBool::new(false), summary: summary.into() }
    }

    pub fn failing_once(summary: impl Into<String>) -> Self {
        Self { fail_once: std::sync::atomic::AtomicBool::new(true), summary: summary.into() }
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(&self, _messages: &[ConversationMessage]) -> Result<String> {
        if self.fail_once.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::llm("summarization unavailable"));
        }
        Ok(self.summary.clone())
    }
}

/// Outbound sender that fails its first `fail_count` calls, then succeeds;
/// every attempt (failed or not) is recorded for assertions.
pub struct FakeChatSender {
    fail_count: Mutex<u32>,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl FakeChatSender {
    pub fn new(fail_count: u32) -> Self {
        Self { fail_count: Mutex::new(fail_count), sent: Mutex::new(Vec::new()) }
    }

    pub fn always_succeeds() -> Self {
        Self::new(0)
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSender for FakeChatSender {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        let mut remaining = self.fail_count.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            Err(Error::upstream(503, "chat-gateway unavailable"))
        } else {
            Ok(())
        }
    }
}

/// Returns pre-programmed tool results in order, recording the operation id
/// and parameters of every call it was asked to make.
pub struct FakeToolExecutor {
    results: Mutex<VecDeque<ToolResult>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeToolExecutor {
    pub fn new(results: Vec<ToolResult>) -> Self {
        Self { results: Mutex::new(results.into()), calls: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeToolExecutor {
    async fn execute(&self, tool_def: &ToolDefinition, parameters: Value) -> Result<ToolResult> {
        self.calls.lock().unwrap().push((tool_def.operation_id.clone(), parameters));
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::other("FakeToolExecutor script exhausted"))
    }
}

/// Resolver returning a fixed identity for one sender and `None` for
/// everyone else.
pub struct FixedIdentityResolver {
    sender: String,
    identity: Identity,
}

impl FixedIdentityResolver {
    pub fn new(sender: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { sender: sender.into(), identity: Identity { user_id: user_id.into() } }
    }
}

#[async_trait]
impl mobility_agent::worker::IdentityResolver for FixedIdentityResolver {
    async fn resolve(&self, sender: &str) -> Result<Option<Identity>> {
        if sender == self.sender {
            Ok(Some(self.identity.clone()))
        } else {
            Ok(None)
        }
    }
}
