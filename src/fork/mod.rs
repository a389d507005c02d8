//! Audio fork: the real-time tap of a call's audio.
//!
//! The media layer streams each call's audio to our WebSocket listener
//! (`server`). Frames are buffered only while capture is enabled; the far end
//! marks the end of each utterance with a `speech_end` event, which completes
//! the single outstanding `wait_for_utterance`.

pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::calling::media::{ForkParams, MediaLayer};
use crate::error::CallError;

/// One completed capture window.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// 16 kHz mono s16le PCM.
    pub audio: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Commands pushed from the engine to the far end of the fork channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkControl {
    Capture { enabled: bool },
    Close,
}

impl ForkControl {
    /// Wire form of a control message, `None` for socket-level commands.
    pub fn to_json(&self) -> Option<String> {
        match self {
            ForkControl::Capture { enabled } => Some(
                serde_json::json!({ "type": "capture", "enabled": enabled }).to_string(),
            ),
            ForkControl::Close => None,
        }
    }
}

/// Text events sent by the far end.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForkEvent {
    SpeechStart,
    SpeechEnd,
    Stop,
}

#[derive(Default)]
struct CaptureState {
    enabled: bool,
    buffer: Vec<u8>,
    /// Utterance completed before anyone was waiting for it.
    ready: Option<Utterance>,
    waiter: Option<oneshot::Sender<Result<Utterance, CallError>>>,
    closed: bool,
}

/// Audio tap for one call.
pub struct AudioForkSession {
    call_id: String,
    state: Mutex<CaptureState>,
    control: mpsc::UnboundedSender<ForkControl>,
    stopped: AtomicBool,
}

impl AudioForkSession {
    pub(crate) fn new(call_id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ForkControl>) {
        let (control, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            call_id: call_id.to_string(),
            state: Mutex::new(CaptureState::default()),
            control,
            stopped: AtomicBool::new(false),
        });
        (session, rx)
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_capture_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Gate whether incoming frames are buffered.
    ///
    /// Every toggle discards partial buffering so one turn's tail never
    /// bleeds into the next turn's capture.
    pub fn set_capture_enabled(&self, enabled: bool) {
        {
            let mut st = self.lock();
            st.enabled = enabled;
            st.buffer.clear();
            st.ready = None;
        }
        tracing::debug!(
            "Call {}: capture {}",
            self.call_id,
            if enabled { "enabled" } else { "disabled" }
        );
        let _ = self.control.send(ForkControl::Capture { enabled });
    }

    /// Feed one audio frame from the far end.
    pub fn push_audio(&self, frame: &[u8]) {
        let mut st = self.lock();
        if st.enabled && !st.closed {
            st.buffer.extend_from_slice(frame);
        }
    }

    /// The far end detected the end of speech: close the capture window.
    pub fn end_of_speech(&self) {
        let mut st = self.lock();
        if !st.enabled || st.buffer.is_empty() {
            return;
        }

        let utterance = Utterance {
            audio: std::mem::take(&mut st.buffer),
            captured_at: Utc::now(),
        };
        tracing::debug!(
            "Call {}: utterance captured ({} bytes)",
            self.call_id,
            utterance.audio.len()
        );

        match st.waiter.take() {
            Some(waiter) => {
                if let Err(Ok(utterance)) = waiter.send(Ok(utterance)) {
                    st.ready = Some(utterance);
                }
            }
            None => st.ready = Some(utterance),
        }
    }

    /// Wait for one complete utterance, bounded by `timeout`.
    ///
    /// Only one wait may be outstanding per session.
    pub async fn wait_for_utterance(&self, timeout: Duration) -> Result<Utterance, CallError> {
        let rx = {
            let mut st = self.lock();
            if st.closed {
                return Err(CallError::ForkClosed);
            }
            if st.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
                return Err(CallError::ForkBusy);
            }
            if let Some(utterance) = st.ready.take() {
                return Ok(utterance);
            }
            let (tx, rx) = oneshot::channel();
            st.waiter = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::ForkClosed),
            Err(_) => {
                self.lock().waiter = None;
                Err(CallError::CaptureTimeout(timeout))
            }
        }
    }

    /// The channel is gone; fail any pending wait.
    pub(crate) fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.enabled = false;
        st.buffer.clear();
        st.ready = None;
        if let Some(waiter) = st.waiter.take() {
            let _ = waiter.send(Err(CallError::ForkClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// End the fork. Best-effort and idempotent.
    pub async fn stop(&self, media: &dyn MediaLayer) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close();
        let _ = self.control.send(ForkControl::Close);
        if let Err(e) = media.stop_fork(&self.call_id).await {
            tracing::warn!("Call {}: failed to stop audio fork: {}", self.call_id, e);
        } else {
            tracing::info!("Call {}: audio fork stopped", self.call_id);
        }
    }
}

impl std::fmt::Debug for AudioForkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioForkSession")
            .field("call_id", &self.call_id)
            .field("capture_enabled", &self.is_capture_enabled())
            .finish()
    }
}

/// Removes a pending fork start however `ForkRegistry::start` exits.
struct PendingStart<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Arc<AudioForkSession>>>,
    call_id: &'a str,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.call_id);
    }
}

/// Live fork sessions and pending fork starts, keyed by call UUID.
pub struct ForkRegistry {
    public_url: String,
    connect_timeout: Duration,
    sessions: DashMap<String, Arc<AudioForkSession>>,
    pending: DashMap<String, oneshot::Sender<Arc<AudioForkSession>>>,
}

impl ForkRegistry {
    pub fn new(public_url: &str, connect_timeout: Duration) -> Self {
        Self {
            public_url: public_url.trim_end_matches('/').to_string(),
            connect_timeout,
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// URL the media layer should stream this call's audio to.
    pub fn fork_url(&self, call_id: &str) -> String {
        format!("{}/fork/{}", self.public_url, call_id)
    }

    /// Ask the media layer to fork the call and wait for the channel to
    /// connect back.
    pub async fn start(
        &self,
        call_id: &str,
        media: &dyn MediaLayer,
    ) -> Result<Arc<AudioForkSession>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.to_string(), tx);
        let _pending = PendingStart {
            pending: &self.pending,
            call_id,
        };

        let params = ForkParams::mono_16k(self.fork_url(call_id));
        tracing::info!("Call {}: starting audio fork to {}", call_id, params.url);

        media.start_fork(call_id, &params).await?;

        match tokio::time::timeout(self.connect_timeout, rx).await {
            Ok(Ok(session)) => Ok(session),
            _ => {
                tracing::warn!(
                    "Call {}: audio fork did not connect within {:?}",
                    call_id,
                    self.connect_timeout
                );
                Err(CallError::ForkTimeout(self.connect_timeout))
            }
        }
    }

    /// Called by the listener when a fork channel connects.
    ///
    /// Returns `None` for call UUIDs nobody is waiting on.
    pub fn attach(
        &self,
        call_id: &str,
    ) -> Option<(Arc<AudioForkSession>, mpsc::UnboundedReceiver<ForkControl>)> {
        let (_, waiter) = self.pending.remove(call_id)?;
        let (session, control_rx) = AudioForkSession::new(call_id);
        self.sessions.insert(call_id.to_string(), session.clone());

        if waiter.send(session.clone()).is_err() {
            self.sessions.remove(call_id);
            return None;
        }
        Some((session, control_rx))
    }

    /// Called by the listener when a fork channel goes away.
    pub fn detach(&self, call_id: &str) {
        if let Some((_, session)) = self.sessions.remove(call_id) {
            session.close();
        }
    }

    #[cfg(test)]
    pub fn get(&self, call_id: &str) -> Option<Arc<AudioForkSession>> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMedia, MediaOp};

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_utterance_completes_wait() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_utterance(Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        session.push_audio(&[1, 2]);
        session.push_audio(&[3, 4]);
        session.end_of_speech();

        let utterance = waiter.await.unwrap().unwrap();
        assert_eq!(utterance.audio, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_utterance_before_wait_is_kept() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);
        session.push_audio(&[9]);
        session.end_of_speech();

        let utterance = session.wait_for_utterance(SHORT).await.unwrap();
        assert_eq!(utterance.audio, vec![9]);
    }

    #[tokio::test]
    async fn test_frames_ignored_while_disabled() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.push_audio(&[1, 2, 3]);
        session.end_of_speech();
        session.set_capture_enabled(true);

        let err = session.wait_for_utterance(SHORT).await.unwrap_err();
        assert!(matches!(err, CallError::CaptureTimeout(_)));
    }

    #[tokio::test]
    async fn test_disable_discards_partial_buffer() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);
        session.push_audio(&[7, 7, 7]);
        session.set_capture_enabled(false);
        session.set_capture_enabled(true);
        session.push_audio(&[1]);
        session.end_of_speech();

        let utterance = session.wait_for_utterance(SHORT).await.unwrap();
        assert_eq!(utterance.audio, vec![1]);
    }

    #[tokio::test]
    async fn test_capture_toggle_is_pushed_to_far_end() {
        let (session, mut rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);
        session.set_capture_enabled(false);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ForkControl::Capture { enabled: true });
        let wire: serde_json::Value = serde_json::from_str(&first.to_json().unwrap()).unwrap();
        assert_eq!(wire, serde_json::json!({ "type": "capture", "enabled": true }));
        assert_eq!(rx.recv().await.unwrap(), ForkControl::Capture { enabled: false });
    }

    #[tokio::test]
    async fn test_second_concurrent_wait_is_rejected() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_utterance(Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = session.wait_for_utterance(SHORT).await;
        assert!(matches!(second, Err(CallError::ForkBusy)));

        session.push_audio(&[5]);
        session.end_of_speech();
        assert_eq!(first.await.unwrap().unwrap().audio, vec![5]);
    }

    #[tokio::test]
    async fn test_timeout_clears_waiter() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);

        assert!(matches!(
            session.wait_for_utterance(SHORT).await,
            Err(CallError::CaptureTimeout(_))
        ));
        // A fresh wait after a timeout is allowed.
        assert!(matches!(
            session.wait_for_utterance(SHORT).await,
            Err(CallError::CaptureTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_wait() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_utterance(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close();

        assert!(matches!(waiter.await.unwrap(), Err(CallError::ForkClosed)));
        assert!(matches!(
            session.wait_for_utterance(SHORT).await,
            Err(CallError::ForkClosed)
        ));
    }

    #[tokio::test]
    async fn test_registry_start_and_attach() {
        let registry = Arc::new(ForkRegistry::new("ws://gw:3001/", Duration::from_secs(1)));
        let media = FakeMedia::new();

        let attach = {
            let registry = registry.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(attached) = registry.attach("c1") {
                        return attached;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let session = registry.start("c1", media.as_ref()).await.unwrap();
        let (attached, _rx) = attach.await.unwrap();
        assert!(Arc::ptr_eq(&session, &attached));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(
            media.count(|op| matches!(op, MediaOp::StartFork(_, url) if url == "ws://gw:3001/fork/c1")),
            1
        );

        registry.detach("c1");
        assert_eq!(registry.active_count(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_registry_start_times_out() {
        let registry = ForkRegistry::new("ws://gw:3001", Duration::from_millis(30));
        let media = FakeMedia::new();

        let err = registry.start("c1", media.as_ref()).await.unwrap_err();
        assert!(matches!(err, CallError::ForkTimeout(_)));
        // A late connection for the timed-out call is rejected.
        assert!(registry.attach("c1").is_none());
    }

    #[tokio::test]
    async fn test_abandoned_start_clears_pending() {
        let registry = ForkRegistry::new("ws://gw:3001", Duration::from_secs(10));
        let media = FakeMedia::new();

        let abandoned = tokio::time::timeout(SHORT, registry.start("c1", media.as_ref())).await;
        assert!(abandoned.is_err());
        assert!(registry.pending.is_empty());
        assert!(registry.attach("c1").is_none());
    }

    #[tokio::test]
    async fn test_failed_fork_request_clears_pending() {
        let registry = ForkRegistry::new("ws://gw:3001", Duration::from_secs(10));
        let media = FakeMedia::new();
        media.fail_start_fork();

        assert!(registry.start("c1", media.as_ref()).await.is_err());
        assert!(registry.pending.is_empty());
    }

    #[test]
    fn test_session_debug_shows_capture_state() {
        let (session, _rx) = AudioForkSession::new("c1");
        session.set_capture_enabled(true);
        let shown = format!("{:?}", session);
        assert!(shown.contains("\"c1\""));
        assert!(shown.contains("capture_enabled: true"));
    }

    #[test]
    fn test_unexpected_attach_is_rejected() {
        let registry = ForkRegistry::new("ws://gw:3001", Duration::from_secs(1));
        assert!(registry.attach("nobody").is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let media = FakeMedia::new();
        let (session, mut rx) = AudioForkSession::new("c1");

        session.stop(media.as_ref()).await;
        session.stop(media.as_ref()).await;

        assert_eq!(media.count(|op| matches!(op, MediaOp::StopFork(_))), 1);
        assert_eq!(rx.recv().await.unwrap(), ForkControl::Close);
        assert!(session.is_closed());
    }

    #[test]
    fn test_parse_fork_events() {
        let e: ForkEvent = serde_json::from_str(r#"{"type":"speech_end"}"#).unwrap();
        assert_eq!(e, ForkEvent::SpeechEnd);
        assert!(serde_json::from_str::<ForkEvent>(r#"{"type":"nope"}"#).is_err());
    }
}
