//! Outbound chat-gateway send (SPEC_FULL.md §6): the HTTP call the outbound
//! pipeline makes once it pops a message off the outbound list. Modeled as
//! a narrow [`ChatSender`] seam, the same way [`crate::agent::Planner`]
//! stands in for the LLM — tests substitute a fake that fails on demand to
//! exercise the retry/DLQ path without a live gateway.

use crate::error::{Error, Result};
use crate::types::OutboundMessage;
use async_trait::async_trait;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Sends one message. Any non-2xx response or transport failure is
    /// surfaced as `Err` — the outbound pipeline treats both identically
    /// and hands the message to `schedule_retry`.
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// Production [`ChatSender`] for the Infobip-shaped WhatsApp send API.
pub struct InfobipChatGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    sender_number: String,
}

impl InfobipChatGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, sender_number: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            sender_number: sender_number.into(),
        }
    }
}

#[async_trait]
impl ChatSender for InfobipChatGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let url = format!("{}/whatsapp/1/message/text", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "from": self.sender_number,
            "to": message.to,
            "content": { "text": message.text },
        });

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("App {}", self.api_key))
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(Error::upstream(status, format!("chat-gateway send failed: {body}")))
        }
    }
}
