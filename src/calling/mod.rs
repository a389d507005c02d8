//! Call model: the per-call record, its transcript, and the handle that
//! carries the hangup signal and the exactly-once teardown guards.

pub mod controller;
pub mod media;
pub mod routing;
pub mod sdp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use self::media::MediaLayer;
use self::routing::DeviceProfile;

/// Speaker of a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Assistant,
}

impl Role {
    /// Label used in the flattened transcript sent with call-end events.
    pub fn label(self) -> &'static str {
        match self {
            Role::Caller => "Caller",
            Role::Assistant => "Claude",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// One accepted call.
#[derive(Debug, Clone)]
pub struct Call {
    /// Call UUID assigned by the media layer.
    pub id: String,
    pub caller_id: String,
    pub dialed: Option<String>,
    pub device: DeviceProfile,
    /// The router fell back to the default profile.
    pub default_device: bool,
    pub transcript: Vec<TranscriptEntry>,
    pub started_at: DateTime<Utc>,
}

impl Call {
    pub fn new(
        id: impl Into<String>,
        caller_id: impl Into<String>,
        dialed: Option<String>,
        device: DeviceProfile,
    ) -> Self {
        Self {
            id: id.into(),
            caller_id: caller_id.into(),
            dialed,
            device,
            default_device: false,
            transcript: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn record(&mut self, role: Role, text: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            role,
            text: text.into(),
            at: Utc::now(),
        });
    }

    /// `Caller: ...\nClaude: ...` rendering of the transcript.
    pub fn flattened_transcript(&self) -> String {
        self.transcript
            .iter()
            .map(|e| format!("{}: {}", e.role.label(), e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared handle for one live call.
///
/// Cloned into the SIP dialog (which fires `hang_up` on BYE), the controller,
/// and the conversation engine. Cleanup and endpoint destruction are each
/// guarded so they happen at most once no matter how many parties race.
#[derive(Clone)]
pub struct CallHandle {
    call_id: String,
    hangup: CancellationToken,
    cleaned_up: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    media: Arc<dyn MediaLayer>,
}

impl CallHandle {
    pub fn new(call_id: impl Into<String>, media: Arc<dyn MediaLayer>) -> Self {
        Self {
            call_id: call_id.into(),
            hangup: CancellationToken::new(),
            cleaned_up: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
            media,
        }
    }

    pub fn id(&self) -> &str {
        &self.call_id
    }

    /// Signal that the remote party (or the media layer) ended the call.
    pub fn hang_up(&self) {
        self.hangup.cancel();
    }

    pub fn is_hung_up(&self) -> bool {
        self.hangup.is_cancelled()
    }

    /// Resolves once the call has been hung up.
    pub async fn hung_up(&self) {
        self.hangup.cancelled().await
    }

    /// Returns true for exactly one caller; everyone else must skip cleanup.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::SeqCst)
    }

    /// Record a destroy notification from the media layer.
    ///
    /// Returns false if the endpoint was already destroyed.
    pub fn mark_destroyed(&self) -> bool {
        let first = !self.destroyed.swap(true, Ordering::SeqCst);
        self.hangup.cancel();
        first
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear down the media endpoint. Idempotent; only the first call reaches
    /// the media layer.
    pub async fn destroy(&self) {
        if !self.mark_destroyed() {
            tracing::debug!("Call {}: endpoint already destroyed", self.call_id);
            return;
        }
        if let Err(e) = self.media.destroy(&self.call_id).await {
            tracing::warn!("Call {}: failed to destroy endpoint: {}", self.call_id, e);
        } else {
            tracing::info!("Call {}: endpoint destroyed", self.call_id);
        }
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.call_id)
            .field("hung_up", &self.is_hung_up())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
