//! # Mobility agent backend
//!
//! The asynchronous message-processing engine that bridges a WhatsApp
//! webhook gateway with an LLM planner and a schema-driven HTTP tool
//! executor: a durable ingress-to-worker pipeline, a worker runtime
//! (batched consumption, distributed locking, rate limiting, retry
//! scheduling), an OpenAPI-backed tool registry with semantic retrieval,
//! a bounded-history conversation store, a dynamic HTTP tool gateway, and
//! the plan/act/observe agent loop tying them together.
//!
//! ## Module map
//!
//! - [`config`] — process configuration (`Settings`, `AppEnv`), loaded
//!   once at startup.
//! - [`error`] — crate-wide `Error`/`Result`.
//! - [`types`] — shared wire/storage types: inbound/outbound messages,
//!   conversation history, tool definitions, tool-call records.
//! - [`kv`] — the `Store` trait over the KV backend, the distributed
//!   lock, and the rate limiter.
//! - [`queue`] — `QueueService`: the inbound stream, outbound list, and
//!   retry sorted set.
//! - [`context`] — `ContextStore`: bounded per-sender history with
//!   LLM-assisted summarization.
//! - [`registry`] — `ToolRegistry`: OpenAPI ingestion, embeddings, hot
//!   reload, semantic retrieval.
//! - [`gateway`] — `ToolGateway`: dynamic HTTP dispatch, OAuth2 refresh,
//!   circuit breaker.
//! - [`llm`] — the chat-completion and embeddings client.
//! - [`chat`] — the outbound chat-gateway send API.
//! - [`agent`] — `AgentLoop`: the bounded plan/act/observe loop.
//! - [`worker`] — the worker runtime tying every pipeline together.
//! - [`metrics`] / [`logging`] — ambient observability.

pub mod agent;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod kv;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod types;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
