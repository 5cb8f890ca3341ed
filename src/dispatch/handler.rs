//! Action handler capability
//!
//! The hosting application decides what an action does ("send alert",
//! "start retraining job"); the engine only knows how to call it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::evaluation::Score;
use crate::types::Priority;

/// Everything a handler learns about the firing it is asked to act on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub trigger_id: String,
    pub action_id: String,
    pub dimension: String,
    pub priority: Priority,
    pub score: Score,
    pub fired_at: DateTime<Utc>,
}

/// Handler for one action id. The returned string is stored as the
/// activation detail; an error marks the activation as failed.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, context: &ActionContext) -> Result<String>;
}

/// Type alias for synchronous handler functions
pub type ActionFn = Arc<dyn Fn(&ActionContext) -> Result<String> + Send + Sync>;

/// Adapts a plain function into an [`ActionHandler`]
pub struct FnHandler {
    handler: ActionFn,
}

#[async_trait]
impl ActionHandler for FnHandler {
    async fn handle(&self, context: &ActionContext) -> Result<String> {
        (self.handler)(context)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(&ActionContext) -> Result<String> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        handler: Arc::new(f),
    })
}

/// Logs the activation at WARN level
pub struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn handle(&self, context: &ActionContext) -> Result<String> {
        warn!(
            trigger = %context.trigger_id,
            dimension = %context.dimension,
            priority = %context.priority,
            score = ?context.score.value,
            "Trigger fired"
        );
        Ok(format!("logged {}", context.trigger_id))
    }
}

/// POSTs the activation context as JSON to a URL
pub struct WebhookAction {
    url: String,
    client: reqwest::Client,
}

impl WebhookAction {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ActionHandler for WebhookAction {
    async fn handle(&self, context: &ActionContext) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(context)
            .send()
            .await
            .with_context(|| format!("Webhook request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook {} returned {}", self.url, status);
        }
        Ok(format!("webhook {} returned {}", self.url, status))
    }
}
