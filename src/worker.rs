//! The worker runtime (SPEC_FULL.md §4.2): the long-running process that
//! shares the inbound stream's consumer group with its peers and, per
//! tick, runs the inbound/outbound/retry pipelines concurrently before
//! yielding briefly (§5). Everything a worker owns in-process — HTTP
//! client, registry snapshot, gateway, context adapter, queue adapter —
//! is constructed once at startup and threaded through explicitly; the
//! only durable state lives in the KV store (SPEC_FULL.md §9).

use crate::agent::{AgentLoop, Identity};
use crate::chat::ChatSender;
use crate::context::ContextStore;
use crate::error::Result;
use crate::kv::{LockGuard, Store, heartbeat, incr_rate};
use crate::metrics::{MessageOutcome, Metrics};
use crate::queue::{InboundEntry, QueueService, RetryOutcome};
use crate::registry::{OpenApiSource, ToolRegistry};
use crate::types::OutboundMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Messages read per inbound tick (SPEC_FULL.md §4.2).
pub const BATCH_SIZE: usize = 10;
/// Block duration for the inbound stream read.
const INBOUND_BLOCK_MS: usize = 2_000;
/// Block duration for the outbound list pop.
const OUTBOUND_BLOCK_SECS: f64 = 1.0;
/// TTL on the per-message distributed lock.
const MESSAGE_LOCK_TTL_MS: usize = 10_000;
/// Requests allowed per sender per 60s window before the rate limiter
/// denies (SPEC_FULL.md §4.7): the 21st request is the first rejected.
const RATE_LIMIT_MAX: i64 = 20;
/// Sleep at the end of a tick that completed without any pipeline error.
const IDLE_TICK_SLEEP: Duration = Duration::from_millis(10);
/// Sleep after a tick in which at least one pipeline errored.
const ERROR_TICK_SLEEP: Duration = Duration::from_secs(1);
/// Upper bound the shutdown path waits for in-flight inbound tasks to
/// drain before closing pools regardless.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves the authenticated identity (if any) behind a sender's phone
/// number. Backed, outside this core, by the relational user-mapping
/// store and onboarding state machine (SPEC_FULL.md §6) — both out of
/// scope here, so this is a narrow seam the same way [`crate::agent::Planner`]
/// stands in for the LLM. Tests substitute a fake returning a fixed
/// identity or `None`.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, sender: &str) -> Result<Option<Identity>>;
}

/// Default resolver for deployments with no user-mapping store wired in:
/// every sender is treated as unauthenticated. `AgentLoop` still functions
/// — it simply never emits the identity-binding instruction.
pub struct AnonymousIdentityResolver;

#[async_trait]
impl IdentityResolver for AnonymousIdentityResolver {
    async fn resolve(&self, _sender: &str) -> Result<Option<Identity>> {
        Ok(None)
    }
}

/// Everything a worker needs, constructed once at startup and passed in
/// rather than assembled from scattered globals (SPEC_FULL.md §9).
pub struct Worker {
    store: Arc<dyn Store>,
    queue: QueueService,
    registry: Arc<ToolRegistry>,
    context: Arc<ContextStore>,
    agent: Arc<AgentLoop>,
    chat: Arc<dyn ChatSender>,
    identity: Arc<dyn IdentityResolver>,
    metrics: Arc<Metrics>,
    consumer_id: String,
    host: String,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ToolRegistry>,
        context: Arc<ContextStore>,
        agent: Arc<AgentLoop>,
        chat: Arc<dyn ChatSender>,
        identity: Arc<dyn IdentityResolver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let host = hostname();
        let consumer_id = format!("{host}:{}", short_uuid());
        Self {
            queue: QueueService::new(store.clone()),
            store,
            registry,
            context,
            agent,
            chat,
            identity,
            metrics,
            consumer_id,
            host,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Exposes the per-sender history adapter for health checks and tests
    /// asserting on post-turn conversation state (SPEC_FULL.md §8).
    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Startup sequence (SPEC_FULL.md §4.2 a-f), steps (b)/(c) are the
    /// caller's responsibility via `source`/`hot_reload_interval_secs`
    /// since they need the OpenAPI source, which `main` resolves from
    /// `Settings`.
    pub async fn startup(&self, source: &OpenApiSource) -> Result<()> {
        self.queue.ensure_consumer_group().await?;
        if let Err(error) = self.registry.load(source).await {
            // Missing OpenAPI source at startup is logged critical but
            // non-fatal: tool calls fail with "tool not found" until the
            // next successful hot-reload (SPEC_FULL.md §7).
            tracing::error!(%error, "failed to load OpenAPI source at startup; continuing with empty registry");
        }
        heartbeat(self.store.as_ref(), &self.host, &self.consumer_id).await?;
        Ok(())
    }

    /// Runs the worker until a shutdown signal is delivered, then drains
    /// in-flight inbound tasks for up to `DRAIN_TIMEOUT` before returning.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        spawn_shutdown_listener(running.clone());

        let mut in_flight = tokio::task::JoinSet::new();

        while running.load(Ordering::SeqCst) {
            if let Err(error) = heartbeat(self.store.as_ref(), &self.host, &self.consumer_id).await {
                tracing::warn!(%error, "heartbeat write failed");
            }

            let (inbound_result, outbound_result, retry_result) = tokio::join!(
                self.tick_inbound(&mut in_flight),
                self.tick_outbound(),
                self.tick_retry(),
            );

            let mut any_failed = false;
            for (label, result) in [("inbound", &inbound_result), ("outbound", &outbound_result), ("retry", &retry_result)] {
                if let Err(error) = result {
                    tracing::error!(%error, pipeline = label, "pipeline tick failed");
                    any_failed = true;
                }
            }

            // Reap completed inbound tasks so the JoinSet doesn't grow
            // unbounded across ticks; errors here are per-task panics,
            // already impossible in normal operation since
            // `handle_inbound_entry` never panics on handled errors.
            while in_flight.try_join_next().is_some() {}

            tokio::time::sleep(if any_failed { ERROR_TICK_SLEEP } else { IDLE_TICK_SLEEP }).await;
        }

        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        Ok(())
    }

    /// Reads up to `BATCH_SIZE` new stream entries and scatters each as a
    /// concurrent task onto `in_flight`, gathering nothing back — a
    /// per-entry failure never cancels its siblings (SPEC_FULL.md §5).
    async fn tick_inbound(&self, in_flight: &mut tokio::task::JoinSet<()>) -> Result<()> {
        let entries = self
            .queue
            .read_inbound_batch(&self.consumer_id, BATCH_SIZE, INBOUND_BLOCK_MS)
            .await?;

        for entry in entries {
            let worker = SharedHandlers {
                store: self.store.clone(),
                queue: QueueService::new(self.store.clone()),
                agent: self.agent.clone(),
                identity: self.identity.clone(),
                metrics: self.metrics.clone(),
            };
            in_flight.spawn(async move { worker.handle_inbound_entry(entry).await });
        }
        Ok(())
    }

    async fn tick_outbound(&self) -> Result<()> {
        let Some(message) = self.queue.pop_outbound(OUTBOUND_BLOCK_SECS).await? else {
            return Ok(());
        };
        match self.chat.send(&message).await {
            Ok(()) => {
                self.metrics.record_outcome(MessageOutcome::Delivered);
            }
            Err(error) => {
                tracing::warn!(%error, to = %message.to, "chat-gateway send failed; scheduling retry");
                match self.queue.schedule_retry(message).await? {
                    RetryOutcome::Scheduled { .. } => self.metrics.record_outcome(MessageOutcome::Retried),
                    RetryOutcome::DeadLettered => self.metrics.record_outcome(MessageOutcome::DeadLettered),
                }
            }
        }
        Ok(())
    }

    async fn tick_retry(&self) -> Result<()> {
        self.queue.promote_due_retry().await?;
        Ok(())
    }
}

/// The subset of a [`Worker`]'s collaborators an inbound-message task
/// needs, cloned cheaply (all `Arc`s) per spawn so the task owns its own
/// handles rather than borrowing from `Worker` across an `await` boundary.
struct SharedHandlers {
    store: Arc<dyn Store>,
    queue: QueueService,
    agent: Arc<AgentLoop>,
    identity: Arc<dyn IdentityResolver>,
    metrics: Arc<Metrics>,
}

impl SharedHandlers {
    /// One inbound entry's full lifecycle (SPEC_FULL.md §4.2, inbound
    /// pipeline steps a-e): lock, rate-limit, invoke `AgentLoop`, ack+del,
    /// DLQ-on-exception, always release the lock.
    async fn handle_inbound_entry(&self, entry: InboundEntry) {
        let started = std::time::Instant::now();
        let lock_resource = format!("msg:{}", entry.message.message_id);
        let lock = match LockGuard::acquire(self.store.as_ref(), lock_resource, MESSAGE_LOCK_TTL_MS).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                // Duplicate webhook delivery: someone else holds the lock.
                // Acknowledge without processing.
                let _ = self.queue.ack_inbound(&entry.stream_id).await;
                return;
            }
            Err(error) => {
                tracing::error!(%error, message_id = %entry.message.message_id, "lock acquisition failed");
                let _ = self.queue.ack_inbound(&entry.stream_id).await;
                return;
            }
        };

        if let Err(error) = self.process(&entry).await {
            tracing::error!(%error, message_id = %entry.message.message_id, sender = %entry.message.sender, "inbound processing failed; routing to DLQ");
            let _ = self.queue.store_inbound_dlq(entry.message.clone(), error.to_string()).await;
            self.metrics.record_outcome(MessageOutcome::DeadLettered);
        }

        // ACK+DEL unconditionally: a poison-pill message must never
        // replay and stall the consumer group (SPEC_FULL.md §7).
        let _ = self.queue.ack_inbound(&entry.stream_id).await;
        if let Some(lock) = lock {
            let _ = lock.release().await;
        }
        self.metrics.record_processing_time(started.elapsed());
    }

    async fn process(&self, entry: &InboundEntry) -> Result<()> {
        let count = incr_rate(self.store.as_ref(), &entry.message.sender).await?;
        if count > RATE_LIMIT_MAX {
            return Ok(());
        }

        let identity = self.identity.resolve(&entry.message.sender).await?;
        let reply = self.agent.handle_turn(&entry.message.sender, &entry.message.text, identity.as_ref()).await?;
        self.queue.enqueue_outbound(OutboundMessage::new(&entry.message.sender, reply)).await?;
        Ok(())
    }
}

/// `<hostname>` half of the consumer id (SPEC_FULL.md §6). Read from the
/// `HOSTNAME` environment variable (set by the container runtime in every
/// deployment target this crate runs under) with a fixed fallback rather
/// than a libc call, since nothing else in the dependency stack needs a
/// direct FFI binding.
fn hostname() -> String {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| "worker".to_string())
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Waits for SIGINT or (on unix) SIGTERM, then flips `running` to false so
/// the main loop stops pulling new work (SPEC_FULL.md §6/§5).
fn spawn_shutdown_listener(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        running.store(false, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("registering SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_max_is_twenty() {
        assert_eq!(RATE_LIMIT_MAX, 20);
    }

    #[test]
    fn batch_size_is_ten() {
        assert_eq!(BATCH_SIZE, 10);
    }

    #[test]
    fn short_uuid_is_eight_hex_chars() {
        let id = short_uuid();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn anonymous_identity_resolver_always_returns_none() {
        let resolver = AnonymousIdentityResolver;
        assert!(resolver.resolve("385000000").await.unwrap().is_none());
    }
}
