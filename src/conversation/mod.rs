//! Conversation engine: the per-call turn loop.
//!
//! ```text
//! Greeting -> TurnReady -> Capturing -> Captured -> Transcribing -> Deciding
//!          -> Querying -> Speaking -> TurnReady | Terminated
//! ```
//!
//! Every suspension point races against the call's hangup signal; a hangup
//! skips straight to cleanup. Cleanup runs exactly once per call.

pub mod phrases;
pub mod voice_line;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{AskRequest, QueryBackend, QUERY_FAILED_RESPONSE};
use crate::calling::media::MediaLayer;
use crate::calling::{Call, CallHandle, Role};
use crate::config::ConversationConfig;
use crate::error::CallError;
use crate::fork::{AudioForkSession, ForkRegistry};
use crate::notify::{self, CallEvent, Notifier};
use crate::speech::{Synthesizer, Transcriber, CAPTURE_SAMPLE_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Greeting,
    TurnReady,
    Capturing,
    Captured,
    Transcribing,
    Deciding,
    Querying,
    Speaking,
    Terminated,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Greeting => "GREETING",
            ConversationState::TurnReady => "TURN_READY",
            ConversationState::Capturing => "CAPTURING",
            ConversationState::Captured => "CAPTURED",
            ConversationState::Transcribing => "TRANSCRIBING",
            ConversationState::Deciding => "DECIDING",
            ConversationState::Querying => "QUERYING",
            ConversationState::Speaking => "SPEAKING",
            ConversationState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    CallerGoodbye,
    MaxTurns,
    Error,
    /// The remote party ended the call.
    Hangup,
}

#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    pub reason: TerminationReason,
    /// Loop iterations, silent ones included.
    pub turns: u32,
    /// Every state entered, in order.
    pub states: Vec<ConversationState>,
}

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub max_turns: u32,
    pub capture_timeout: Duration,
    pub hold_music_url: Option<String>,
    pub ready_cue_url: Option<String>,
    pub got_it_cue_url: Option<String>,
}

impl From<&ConversationConfig> for ConversationSettings {
    fn from(config: &ConversationConfig) -> Self {
        Self {
            max_turns: config.max_turns,
            capture_timeout: Duration::from_secs(config.capture_timeout_secs),
            hold_music_url: config.hold_music_url.clone(),
            ready_cue_url: config.ready_cue_url.clone(),
            got_it_cue_url: config.got_it_cue_url.clone(),
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self::from(&ConversationConfig::default())
    }
}

/// External services the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub media: Arc<dyn MediaLayer>,
    pub forks: Arc<ForkRegistry>,
    pub stt: Arc<dyn Transcriber>,
    pub tts: Arc<dyn Synthesizer>,
    pub brain: Arc<dyn QueryBackend>,
    pub notifier: Arc<dyn Notifier>,
}

/// Per-run bookkeeping.
struct Progress {
    call_id: String,
    turns: u32,
    states: Vec<ConversationState>,
    fork: Option<Arc<AudioForkSession>>,
}

impl Progress {
    fn enter(&mut self, state: ConversationState) {
        tracing::debug!("Call {}: -> {}", self.call_id, state);
        self.states.push(state);
    }
}

/// Run `fut` unless the call is hung up first.
async fn until_hangup<T>(
    handle: &CallHandle,
    fut: impl Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    tokio::select! {
        biased;
        _ = handle.hung_up() => Err(CallError::Hangup),
        result = fut => result,
    }
}

pub struct ConversationEngine {
    collab: Collaborators,
    settings: ConversationSettings,
}

impl ConversationEngine {
    pub fn new(collab: Collaborators, settings: ConversationSettings) -> Self {
        Self { collab, settings }
    }

    /// Converse until the caller says goodbye, the turn limit is reached,
    /// the call is hung up, or something fails. Always cleans up.
    pub async fn run(&self, call: &mut Call, handle: &CallHandle) -> ConversationOutcome {
        let mut progress = Progress {
            call_id: call.id.clone(),
            turns: 0,
            states: Vec::new(),
            fork: None,
        };

        let reason = match self.converse(call, handle, &mut progress).await {
            Ok(reason) => reason,
            Err(_) if handle.is_hung_up() => TerminationReason::Hangup,
            Err(e) => {
                tracing::error!(
                    "Call {}: conversation failed in {}: {}",
                    call.id,
                    progress.states.last().copied().unwrap_or(ConversationState::Greeting),
                    e
                );
                self.fail_gracefully(call, handle, progress.fork.as_deref()).await;
                TerminationReason::Error
            }
        };

        progress.enter(ConversationState::Terminated);
        tracing::info!(
            "Call {}: conversation ended ({:?}) after {} turns",
            call.id,
            reason,
            progress.turns
        );
        self.cleanup(call, handle, progress.fork.as_deref(), progress.turns)
            .await;

        ConversationOutcome {
            reason,
            turns: progress.turns,
            states: progress.states,
        }
    }

    async fn converse(
        &self,
        call: &mut Call,
        handle: &CallHandle,
        progress: &mut Progress,
    ) -> Result<TerminationReason, CallError> {
        progress.enter(ConversationState::Greeting);
        let greeting = phrases::greeting(&call.device, call.default_device);
        self.speak(call, handle, &greeting).await?;

        let fork = until_hangup(
            handle,
            self.collab.forks.start(&call.id, self.collab.media.as_ref()),
        )
        .await?;
        progress.fork = Some(fork.clone());

        loop {
            if progress.turns >= self.settings.max_turns {
                progress.enter(ConversationState::Speaking);
                call.record(Role::Assistant, phrases::MAX_TURNS_LINE);
                self.speak(call, handle, phrases::MAX_TURNS_LINE).await?;
                return Ok(TerminationReason::MaxTurns);
            }
            progress.turns += 1;

            progress.enter(ConversationState::TurnReady);
            self.play_cue(call, handle, self.settings.ready_cue_url.as_deref())
                .await?;
            fork.set_capture_enabled(true);

            progress.enter(ConversationState::Capturing);
            let utterance = match until_hangup(
                handle,
                fork.wait_for_utterance(self.settings.capture_timeout),
            )
            .await
            {
                Ok(utterance) => utterance,
                Err(CallError::CaptureTimeout(after)) => {
                    tracing::info!("Call {}: nothing heard within {:?}", call.id, after);
                    fork.set_capture_enabled(false);
                    self.speak(call, handle, phrases::DIDNT_HEAR).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            progress.enter(ConversationState::Captured);
            fork.set_capture_enabled(false);
            self.play_cue(call, handle, self.settings.got_it_cue_url.as_deref())
                .await?;

            progress.enter(ConversationState::Transcribing);
            let text = match until_hangup(
                handle,
                self.collab
                    .stt
                    .transcribe(&utterance.audio, CAPTURE_SAMPLE_RATE),
            )
            .await
            {
                Ok(text) => text.trim().to_string(),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Call {}: {}", call.id, e);
                    String::new()
                }
                Err(e) => return Err(e),
            };
            tracing::info!("Call {}: caller said {:?}", call.id, text);
            call.record(Role::Caller, text.clone());

            progress.enter(ConversationState::Deciding);
            if phrases::needs_clarification(&text) {
                self.speak(call, handle, phrases::CLARIFY).await?;
                continue;
            }
            if phrases::is_goodbye(&text) {
                call.record(Role::Assistant, phrases::FAREWELL);
                self.speak(call, handle, phrases::FAREWELL).await?;
                return Ok(TerminationReason::CallerGoodbye);
            }

            progress.enter(ConversationState::Querying);
            let raw = self.query(call, handle, &text).await?;

            progress.enter(ConversationState::Speaking);
            let mut line = voice_line::extract(&raw);
            if line.is_empty() {
                line = QUERY_FAILED_RESPONSE.to_string();
            }
            call.record(Role::Assistant, line.clone());
            self.speak(call, handle, &line).await?;
        }
    }

    async fn speak(&self, call: &Call, handle: &CallHandle, text: &str) -> Result<(), CallError> {
        until_hangup(handle, async {
            let audio = self.collab.tts.synthesize(text, &call.device.voice).await?;
            self.collab.media.play(&call.id, &audio).await
        })
        .await
    }

    /// Cues are cosmetic: only a hangup stops the call here.
    async fn play_cue(
        &self,
        call: &Call,
        handle: &CallHandle,
        url: Option<&str>,
    ) -> Result<(), CallError> {
        let Some(url) = url else {
            return Ok(());
        };
        match until_hangup(handle, self.collab.media.play_url(&call.id, url)).await {
            Err(CallError::Hangup) => Err(CallError::Hangup),
            Err(e) => {
                tracing::warn!("Call {}: cue {} failed: {}", call.id, url, e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Filler line, hold music while the bridge works, then silence the
    /// music before anything else is played.
    async fn query(&self, call: &Call, handle: &CallHandle, text: &str) -> Result<String, CallError> {
        self.speak(call, handle, phrases::thinking_phrase()).await?;

        // Detached: the loop never waits on hold music, and its failure is
        // only logged.
        let hold = self.settings.hold_music_url.clone().map(|url| {
            let media = self.collab.media.clone();
            let call_id = call.id.clone();
            tokio::spawn(async move {
                if let Err(e) = media.play_url(&call_id, &url).await {
                    tracing::warn!("Call {}: hold music failed: {}", call_id, e);
                }
            })
        });

        let request = AskRequest {
            prompt: text.to_string(),
            call_id: Some(call.id.clone()),
            device_prompt: call.device.prompt.clone(),
        };
        let answer = until_hangup(handle, async {
            Ok(self.collab.brain.ask(request).await)
        })
        .await;

        if let Some(hold) = hold {
            hold.abort();
        }
        match until_hangup(handle, self.collab.media.interrupt(&call.id)).await {
            Ok(()) | Err(CallError::Hangup) => {}
            Err(e) => tracing::debug!("Call {}: interrupt failed: {}", call.id, e),
        }

        let answer = answer?;
        tracing::info!(
            "Call {}: answer after {} ms: {:?}",
            call.id,
            answer.duration_ms,
            answer.response
        );
        Ok(answer.response)
    }

    async fn fail_gracefully(
        &self,
        call: &mut Call,
        handle: &CallHandle,
        fork: Option<&AudioForkSession>,
    ) {
        if let Some(fork) = fork {
            fork.set_capture_enabled(false);
        }
        if handle.is_hung_up() {
            return;
        }
        call.record(Role::Assistant, phrases::APOLOGY);
        if let Err(e) = self.speak(call, handle, phrases::APOLOGY).await {
            tracing::warn!("Call {}: could not play apology: {}", call.id, e);
        }
    }

    /// Release everything the call holds. Each step is independent of the
    /// others' failures.
    async fn cleanup(
        &self,
        call: &Call,
        handle: &CallHandle,
        fork: Option<&AudioForkSession>,
        turns: u32,
    ) {
        if !handle.begin_cleanup() {
            tracing::debug!("Call {}: cleanup already ran", call.id);
            return;
        }
        self.collab.brain.end_session(&call.id).await;
        if let Some(fork) = fork {
            fork.stop(self.collab.media.as_ref()).await;
        }
        notify::dispatch(&self.collab.notifier, CallEvent::ended(call, turns));
        handle.destroy().await;
    }
}
