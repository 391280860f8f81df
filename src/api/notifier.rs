//! Best-effort notifications to tenants and the operator.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

/// Who a notification is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Audience {
    /// The tenant, by user id
    Tenant(String),
    Operator,
}

/// Notification sink. Delivery is best-effort and never raises.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `true` if the message was handed off.
    async fn notify(&self, audience: Audience, subject: &str, body: &str) -> bool;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    audience: &'a Audience,
    operator: Option<&'a str>,
    subject: &'a str,
    body: &'a str,
}

/// Posts `{audience, operator, subject, body}` JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    operator: Option<String>,
}

impl WebhookNotifier {
    /// `operator` is the operator's address, forwarded with every message.
    pub fn new(url: impl Into<String>, operator: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            operator,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, audience: Audience, subject: &str, body: &str) -> bool {
        let payload = WebhookPayload {
            audience: &audience,
            operator: self.operator.as_deref(),
            subject,
            body,
        };

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(?audience, subject, "Notification sent");
                true
            }
            Ok(response) => {
                warn!(?audience, subject, status = %response.status(), "Notification rejected");
                false
            }
            Err(e) => {
                warn!(?audience, subject, error = %e, "Notification failed");
                false
            }
        }
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, audience: Audience, subject: &str, body: &str) -> bool {
        info!(?audience, subject, body, "Notification");
        true
    }
}
