//! `QueueService`: the only module that addresses the three durable queue
//! structures (inbound stream, outbound list, retry sorted set) through
//! [`Store`]. Everything else — the worker's three pipelines, the webhook
//! receiver (out of scope), the retry scheduler — goes through this thin,
//! pure adapter (SPEC_FULL.md §4.1).

use crate::error::Result;
use crate::kv::Store;
use crate::types::{DeadLetterEntry, InboundMessage, OutboundMessage};
use std::sync::Arc;

pub const INBOUND_STREAM: &str = "inbound_stream";
pub const CONSUMER_GROUP: &str = "workers_group";
pub const OUTBOUND_LIST: &str = "outbound_queue";
pub const RETRY_ZSET: &str = "retry_zset";
pub const INBOUND_DLQ: &str = "dlq:inbound";
pub const OUTBOUND_DLQ: &str = "dlq:outbound";

/// Maximum `attempts` an [`OutboundMessage`] may reach before it is routed
/// to the outbound DLQ instead of the retry set.
pub const MAX_ATTEMPTS: u32 = 5;

/// One entry popped off the inbound stream: its stream id (needed for
/// ACK/DEL) and the deserialized payload.
#[derive(Debug, Clone)]
pub struct InboundEntry {
    pub stream_id: String,
    pub message: InboundMessage,
}

/// Outcome of [`QueueService::schedule_retry`]: either the message was
/// re-armed in the retry set, or it exhausted its attempt budget and was
/// routed to the outbound DLQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { score: i64 },
    DeadLettered,
}

pub struct QueueService {
    store: Arc<dyn Store>,
}

impl QueueService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates `workers_group` on the inbound stream if it doesn't already
    /// exist. The "already exists" condition is expected on every restart
    /// after the first and is swallowed by the `Store` implementation.
    pub async fn ensure_consumer_group(&self) -> Result<()> {
        self.store.stream_ensure_group(INBOUND_STREAM, CONSUMER_GROUP).await
    }

    /// Appends an inbound message to the stream, returning the server-
    /// assigned stream id.
    pub async fn enqueue_inbound(
        &self,
        sender: impl Into<String>,
        text: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<String> {
        let message = InboundMessage {
            sender: sender.into(),
            text: text.into(),
            message_id: message_id.into(),
            timestamp: crate::utils::now_millis(),
        };
        let payload = serde_json::to_string(&message)?;
        self.store.stream_add(INBOUND_STREAM, &payload).await
    }

    /// Reads up to `batch_size` new entries for `consumer`, blocking for at
    /// most `block_ms` milliseconds if none are immediately available.
    /// Entries that fail to deserialize are skipped rather than poisoning
    /// the whole batch.
    pub async fn read_inbound_batch(
        &self,
        consumer: &str,
        batch_size: usize,
        block_ms: usize,
    ) -> Result<Vec<InboundEntry>> {
        let raw = self
            .store
            .stream_read_group(INBOUND_STREAM, CONSUMER_GROUP, consumer, batch_size, block_ms)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|entry| {
                serde_json::from_str::<InboundMessage>(&entry.payload)
                    .ok()
                    .map(|message| InboundEntry { stream_id: entry.id, message })
            })
            .collect())
    }

    /// Acknowledges and deletes a stream entry. Both are issued so the
    /// pending-entries list and the stream itself stay small; acking alone
    /// would leave the consumed entry in the stream forever.
    pub async fn ack_inbound(&self, stream_id: &str) -> Result<()> {
        self.store.stream_ack_del(INBOUND_STREAM, CONSUMER_GROUP, stream_id).await
    }

    /// Right-pushes an outbound message.
    pub async fn enqueue_outbound(&self, message: OutboundMessage) -> Result<()> {
        let payload = serde_json::to_string(&message)?;
        self.store.list_push_right(OUTBOUND_LIST, &payload).await
    }

    /// Blocking left-pop off the outbound list with a 1s timeout (per
    /// SPEC_FULL.md §4.2's outbound pipeline).
    pub async fn pop_outbound(&self, timeout_secs: f64) -> Result<Option<OutboundMessage>> {
        match self.store.list_pop_left_blocking(OUTBOUND_LIST, timeout_secs).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Increments `attempts`; if the budget (`MAX_ATTEMPTS`) is exhausted,
    /// routes the payload to the outbound DLQ. Otherwise adds it to the
    /// retry sorted set scored by `now + 2^attempts` seconds (2, 4, 8, 16,
    /// 32s for attempts 1..5).
    pub async fn schedule_retry(&self, mut message: OutboundMessage) -> Result<RetryOutcome> {
        message.attempts += 1;
        if message.attempts >= MAX_ATTEMPTS {
            self.store_outbound_dlq(message, "max_retries".to_string()).await?;
            return Ok(RetryOutcome::DeadLettered);
        }
        let delay = 2i64.pow(message.attempts);
        let score = crate::utils::now_secs() + delay;
        let payload = serde_json::to_string(&message)?;
        self.store.zset_add(RETRY_ZSET, &payload, score).await?;
        Ok(RetryOutcome::Scheduled { score })
    }

    /// Atomically pops at most one retry-set member whose score has
    /// elapsed and re-enqueues it to the outbound list, preserving `cid`
    /// and `attempts`. Returns `true` if an entry was moved.
    pub async fn promote_due_retry(&self) -> Result<bool> {
        let now = crate::utils::now_secs();
        match self.store.zset_pop_due(RETRY_ZSET, now).await? {
            Some(payload) => {
                self.store.list_push_right(OUTBOUND_LIST, &payload).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn store_inbound_dlq(&self, payload: InboundMessage, error: String) -> Result<()> {
        let entry = DeadLetterEntry { payload, error, failed_at: crate::utils::now_millis() };
        let json = serde_json::to_string(&entry)?;
        self.store.list_push_right(INBOUND_DLQ, &json).await
    }

    pub async fn store_outbound_dlq(&self, payload: OutboundMessage, error: String) -> Result<()> {
        let entry = DeadLetterEntry { payload, error, failed_at: crate::utils::now_millis() };
        let json = serde_json::to_string(&entry)?;
        self.store.list_push_right(OUTBOUND_DLQ, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_doubles_each_attempt() {
        let delays: Vec<i64> = (1..5).map(|a| 2i64.pow(a)).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[test]
    fn max_attempts_is_five() {
        assert_eq!(MAX_ATTEMPTS, 5);
    }

    #[test]
    fn dead_letter_entry_serializes_with_error_and_timestamp() {
        let msg = OutboundMessage::new("385", "hi");
        let entry = DeadLetterEntry { payload: msg, error: "max_retries".to_string(), failed_at: 123 };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["error"], "max_retries");
        assert_eq!(json["failed_at"], 123);
        assert_eq!(json["to"], "385");
    }
}
