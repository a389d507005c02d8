//! Outbound call-event notifications.
//!
//! Best-effort only: events are posted from a detached task, and failures are
//! logged and dropped. The call flow never waits on them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::calling::Call;
use crate::error::CallError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStarted {
    pub call_id: String,
    pub device: String,
    pub caller_id: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call_id: String,
    pub device: String,
    pub caller_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub turn_count: u32,
    pub transcript: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CallEvent {
    Started(CallStarted),
    Ended(CallEnded),
}

impl CallEvent {
    pub fn started(call: &Call) -> Self {
        CallEvent::Started(CallStarted {
            call_id: call.id.clone(),
            device: call.device.name.clone(),
            caller_id: call.caller_id.clone(),
            message: "call started".to_string(),
            time: Utc::now(),
        })
    }

    pub fn ended(call: &Call, turn_count: u32) -> Self {
        CallEvent::Ended(CallEnded {
            call_id: call.id.clone(),
            device: call.device.name.clone(),
            caller_id: call.caller_id.clone(),
            start_time: call.started_at,
            end_time: Utc::now(),
            turn_count,
            transcript: call.flattened_transcript(),
        })
    }

    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::Started(e) => &e.call_id,
            CallEvent::Ended(e) => &e.call_id,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CallEvent) -> Result<(), CallError>;
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &CallEvent) -> Result<(), CallError> {
        Ok(())
    }
}

pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &CallEvent) -> Result<(), CallError> {
        let resp = self
            .http
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| CallError::Notification(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CallError::Notification(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget: post `event` from a detached task. Errors are logged,
/// never returned, and the caller does not wait.
pub fn dispatch(notifier: &Arc<dyn Notifier>, event: CallEvent) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&event).await {
            tracing::warn!("Call {}: notification failed: {}", event.call_id(), e);
        }
    });
}
