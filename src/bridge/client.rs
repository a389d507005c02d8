//! HTTP client for a bridge running in another process.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::{AskRequest, AskResponse, Health, QueryBackend};

pub struct HttpBridgeClient {
    http: reqwest::Client,
    base: String,
}

impl HttpBridgeClient {
    /// `timeout` bounds each request; it should exceed the bridge's own
    /// subprocess limit so the bridge gets to answer with its apology first.
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn try_ask(&self, request: &AskRequest) -> Result<AskResponse> {
        let url = format!("{}/ask", self.base);
        tracing::debug!("Bridge POST {}", url);

        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Bridge POST {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Bridge /ask failed ({}): {}", status, body);
        }

        resp.json().await.context("Failed to parse bridge response")
    }

    pub async fn health(&self) -> Result<Health> {
        let url = format!("{}/health", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Bridge GET {} failed", url))?;
        resp.error_for_status()
            .context("Bridge health check failed")?
            .json()
            .await
            .context("Failed to parse bridge health")
    }
}

#[async_trait]
impl QueryBackend for HttpBridgeClient {
    async fn ask(&self, request: AskRequest) -> AskResponse {
        let started = Instant::now();
        match self.try_ask(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(
                    "Bridge query failed for call {}: {:#}",
                    request.call_id.as_deref().unwrap_or("-"),
                    e
                );
                AskResponse::apology(started.elapsed().as_millis() as u64)
            }
        }
    }

    async fn end_session(&self, call_id: &str) {
        let url = format!("{}/end-session", self.base);
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "callId": call_id }))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            tracing::warn!("Call {}: failed to end bridge session: {}", call_id, e);
        }
    }
}
