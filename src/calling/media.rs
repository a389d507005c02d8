//! Media layer: the external media server that owns RTP endpoints.
//!
//! The engine never touches RTP itself. It asks the media server to create an
//! endpoint from the caller's SDP, play audio, fork the call's audio to our
//! WebSocket listener, send DTMF, and finally destroy the endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CallError;

/// An endpoint created by the media server for one call.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaEndpoint {
    /// Call UUID assigned by the media layer.
    pub uuid: String,
    /// Local SDP answer to send back to the caller.
    pub sdp: String,
}

/// Parameters for an audio fork.
#[derive(Debug, Clone, Serialize)]
pub struct ForkParams {
    pub url: String,
    pub mix: &'static str,
    pub rate: &'static str,
}

impl ForkParams {
    /// Mono mix at 16 kHz, the only format the capture path expects.
    pub fn mono_16k(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mix: "mono",
            rate: "16k",
        }
    }
}

#[async_trait]
pub trait MediaLayer: Send + Sync {
    /// Create an endpoint from the caller's (sanitized) offer.
    async fn create_endpoint(&self, remote_sdp: &str) -> Result<MediaEndpoint, CallError>;

    /// Play an audio clip (WAV bytes). Resolves when playback finishes.
    async fn play(&self, call_id: &str, audio: &[u8]) -> Result<(), CallError>;

    /// Play a file or stream the media server can fetch itself.
    async fn play_url(&self, call_id: &str, url: &str) -> Result<(), CallError>;

    /// Stop whatever is currently playing on the channel.
    async fn interrupt(&self, call_id: &str) -> Result<(), CallError>;

    async fn start_fork(&self, call_id: &str, params: &ForkParams) -> Result<(), CallError>;

    async fn stop_fork(&self, call_id: &str) -> Result<(), CallError>;

    async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<(), CallError>;

    async fn destroy(&self, call_id: &str) -> Result<(), CallError>;
}

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the media server control API.
pub struct HttpMediaLayer {
    http: reqwest::Client,
    base: String,
    /// Bound on requests that do not wait for playback.
    control_timeout: Duration,
}

impl HttpMediaLayer {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            control_timeout: CONTROL_TIMEOUT,
        })
    }

    fn endpoint_url(&self, call_id: &str, action: &str) -> String {
        if action.is_empty() {
            format!("{}/endpoints/{}", self.base, call_id)
        } else {
            format!("{}/endpoints/{}/{}", self.base, call_id, action)
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<(), CallError> {
        let resp = req
            .send()
            .await
            .map_err(|e| CallError::Media(format!("{} request failed: {}", what, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::Media(format!("{} failed ({}): {}", what, status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaLayer for HttpMediaLayer {
    async fn create_endpoint(&self, remote_sdp: &str) -> Result<MediaEndpoint, CallError> {
        let url = format!("{}/endpoints", self.base);
        tracing::debug!("Media POST {}", url);

        let resp = self
            .http
            .post(&url)
            .timeout(self.control_timeout)
            .json(&serde_json::json!({ "sdp": remote_sdp }))
            .send()
            .await
            .map_err(|e| CallError::MediaNegotiation(format!("create endpoint: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::MediaNegotiation(format!(
                "create endpoint failed ({}): {}",
                status, body
            )));
        }

        resp.json::<MediaEndpoint>()
            .await
            .map_err(|e| CallError::MediaNegotiation(format!("bad endpoint response: {}", e)))
    }

    async fn play(&self, call_id: &str, audio: &[u8]) -> Result<(), CallError> {
        let req = self
            .http
            .post(self.endpoint_url(call_id, "play"))
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec());
        self.send(req, "play").await
    }

    async fn play_url(&self, call_id: &str, url: &str) -> Result<(), CallError> {
        let req = self
            .http
            .post(self.endpoint_url(call_id, "play-url"))
            .json(&serde_json::json!({ "url": url }));
        self.send(req, "play-url").await
    }

    async fn interrupt(&self, call_id: &str) -> Result<(), CallError> {
        let req = self
            .http
            .post(self.endpoint_url(call_id, "interrupt"))
            .timeout(self.control_timeout);
        self.send(req, "interrupt").await
    }

    async fn start_fork(&self, call_id: &str, params: &ForkParams) -> Result<(), CallError> {
        let req = self
            .http
            .post(self.endpoint_url(call_id, "fork"))
            .timeout(self.control_timeout)
            .json(params);
        self.send(req, "start fork").await
    }

    async fn stop_fork(&self, call_id: &str) -> Result<(), CallError> {
        let req = self
            .http
            .delete(self.endpoint_url(call_id, "fork"))
            .timeout(self.control_timeout);
        self.send(req, "stop fork").await
    }

    async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<(), CallError> {
        let req = self
            .http
            .post(self.endpoint_url(call_id, "dtmf"))
            .timeout(self.control_timeout)
            .json(&serde_json::json!({ "digits": digits }));
        self.send(req, "dtmf").await
    }

    async fn destroy(&self, call_id: &str) -> Result<(), CallError> {
        let req = self
            .http
            .delete(self.endpoint_url(call_id, ""))
            .timeout(self.control_timeout);
        self.send(req, "destroy").await
    }
}
