//! In-memory fakes of the external collaborators, for driving calls end to
//! end in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bridge::runner::{QueryError, QueryInvocation, QueryRunner, SessionMode};
use crate::bridge::{BridgeSettings, MemorySessionStore, QuerySessionBridge};
use crate::calling::controller::CallController;
use crate::calling::media::{ForkParams, MediaEndpoint, MediaLayer};
use crate::calling::routing::{DeviceProfile, DeviceRouter};
use crate::calling::CallHandle;
use crate::config::DtmfHookConfig;
use crate::conversation::{Collaborators, ConversationEngine, ConversationSettings};
use crate::error::CallError;
use crate::fork::{ForkControl, ForkRegistry};
use crate::notify::{CallEvent, Notifier};
use crate::speech::{Synthesizer, Transcriber};

/// Call UUID handed out by `FakeMedia::create_endpoint`.
pub const FAKE_CALL_ID: &str = "call-1";

/// Recorded media-layer command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOp {
    CreateEndpoint(String),
    /// Played audio, decoded as text (see `FakeTts`).
    Play(String, String),
    PlayUrl(String, String),
    Interrupt(String),
    StartFork(String, String),
    StopFork(String),
    Dtmf(String, String),
    Destroy(String),
}

/// What the simulated caller does when capture is enabled.
#[derive(Debug, Clone, Copy)]
pub enum Say {
    Words(&'static str),
    Silence,
}

#[derive(Default)]
struct Faults {
    create: bool,
    play_url: bool,
    start_fork: bool,
    stall_interrupt: bool,
    hangup_on_play: Option<(String, CallHandle)>,
}

pub struct FakeMedia {
    ops: Mutex<Vec<MediaOp>>,
    faults: Mutex<Faults>,
    caller: Option<(Arc<ForkRegistry>, Arc<Mutex<VecDeque<Say>>>)>,
}

impl FakeMedia {
    /// Media layer whose forks never connect back.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            caller: None,
        })
    }

    /// Media layer with a simulated caller on the far end of every fork.
    ///
    /// Each time capture is enabled the next scripted line is spoken; an
    /// exhausted script is silence.
    pub fn with_caller(registry: Arc<ForkRegistry>, script: Vec<Say>) -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            caller: Some((registry, Arc::new(Mutex::new(script.into())))),
        })
    }

    pub fn fail_create(&self) {
        self.faults.lock().unwrap().create = true;
    }

    pub fn fail_play_url(&self) {
        self.faults.lock().unwrap().play_url = true;
    }

    pub fn fail_start_fork(&self) {
        self.faults.lock().unwrap().start_fork = true;
    }

    /// `interrupt` never returns.
    pub fn stall_interrupt(&self) {
        self.faults.lock().unwrap().stall_interrupt = true;
    }

    /// Playing audio containing `needle` fails and hangs up the call.
    pub fn hangup_on_play(&self, needle: &str, handle: CallHandle) {
        self.faults.lock().unwrap().hangup_on_play = Some((needle.to_string(), handle));
    }

    pub fn ops(&self) -> Vec<MediaOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&MediaOp) -> bool) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| pred(op)).count()
    }

    /// Texts played so far, in order.
    pub fn played(&self) -> Vec<String> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                MediaOp::Play(_, text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: MediaOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn spawn_caller(&self, call_id: &str) {
        let Some((registry, script)) = self.caller.clone() else {
            return;
        };
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            let Some((session, mut control)) = registry.attach(&call_id) else {
                return;
            };
            while let Some(cmd) = control.recv().await {
                match cmd {
                    ForkControl::Capture { enabled: true } => {
                        let next = script.lock().unwrap().pop_front();
                        if let Some(Say::Words(words)) = next {
                            session.push_audio(words.as_bytes());
                            session.end_of_speech();
                        }
                    }
                    ForkControl::Capture { enabled: false } => {}
                    ForkControl::Close => break,
                }
            }
            registry.detach(&call_id);
        });
    }
}

#[async_trait]
impl MediaLayer for FakeMedia {
    async fn create_endpoint(&self, remote_sdp: &str) -> Result<MediaEndpoint, CallError> {
        self.record(MediaOp::CreateEndpoint(remote_sdp.to_string()));
        if self.faults.lock().unwrap().create {
            return Err(CallError::MediaNegotiation("no common codec".into()));
        }
        Ok(MediaEndpoint {
            uuid: FAKE_CALL_ID.to_string(),
            sdp: "v=0\r\nm=audio 4000 RTP/AVP 0\r\n".to_string(),
        })
    }

    async fn play(&self, call_id: &str, audio: &[u8]) -> Result<(), CallError> {
        let text = String::from_utf8_lossy(audio).to_string();
        self.record(MediaOp::Play(call_id.to_string(), text.clone()));
        let hangup = self.faults.lock().unwrap().hangup_on_play.clone();
        if let Some((needle, handle)) = hangup {
            if text.contains(&needle) {
                handle.hang_up();
                return Err(CallError::Media("endpoint gone".into()));
            }
        }
        Ok(())
    }

    async fn play_url(&self, call_id: &str, url: &str) -> Result<(), CallError> {
        self.record(MediaOp::PlayUrl(call_id.to_string(), url.to_string()));
        if self.faults.lock().unwrap().play_url {
            return Err(CallError::Media("file not found".into()));
        }
        Ok(())
    }

    async fn interrupt(&self, call_id: &str) -> Result<(), CallError> {
        self.record(MediaOp::Interrupt(call_id.to_string()));
        if self.faults.lock().unwrap().stall_interrupt {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start_fork(&self, call_id: &str, params: &ForkParams) -> Result<(), CallError> {
        self.record(MediaOp::StartFork(call_id.to_string(), params.url.clone()));
        if self.faults.lock().unwrap().start_fork {
            return Err(CallError::Media("fork refused".into()));
        }
        self.spawn_caller(call_id);
        Ok(())
    }

    async fn stop_fork(&self, call_id: &str) -> Result<(), CallError> {
        self.record(MediaOp::StopFork(call_id.to_string()));
        Ok(())
    }

    async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<(), CallError> {
        self.record(MediaOp::Dtmf(call_id.to_string(), digits.to_string()));
        Ok(())
    }

    async fn destroy(&self, call_id: &str) -> Result<(), CallError> {
        self.record(MediaOp::Destroy(call_id.to_string()));
        Ok(())
    }
}

/// Transcriber that reads the "audio" back as UTF-8. `<fail>` errors.
#[derive(Default)]
pub struct FakeStt {
    registry: Option<Arc<ForkRegistry>>,
    capture_seen: Mutex<Vec<bool>>,
}

impl FakeStt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Also record whether capture was still enabled at transcription time.
    pub fn watching(registry: Arc<ForkRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry: Some(registry),
            capture_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn capture_seen(&self) -> Vec<bool> {
        self.capture_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for FakeStt {
    async fn transcribe(&self, pcm: &[u8], _sample_rate: u32) -> Result<String, CallError> {
        if let Some(ref registry) = self.registry {
            let enabled = registry
                .get(FAKE_CALL_ID)
                .is_some_and(|s| s.is_capture_enabled());
            self.capture_seen.lock().unwrap().push(enabled);
        }
        let text = String::from_utf8_lossy(pcm).to_string();
        if text == "<fail>" {
            return Err(CallError::Transcription("decoder crashed".into()));
        }
        Ok(text)
    }
}

/// Synthesizer whose "audio" is the text itself.
pub struct FakeTts;

#[async_trait]
impl Synthesizer for FakeTts {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, CallError> {
        Ok(text.as_bytes().to_vec())
    }
}

enum Reply {
    Text(String),
    Fail,
    NoSpawn,
    /// Time out on the first run, then answer.
    TimeoutThen(String),
}

pub struct FakeRunner {
    reply: Reply,
    delay: Duration,
    calls: Mutex<Vec<QueryInvocation>>,
}

impl FakeRunner {
    pub fn replying(text: &str) -> Arc<Self> {
        Self::replying_after(text, Duration::ZERO)
    }

    pub fn replying_after(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Reply::Text(text.to_string()),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Every run exits non-zero.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: Reply::Fail,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// The executable cannot be started.
    pub fn unspawnable() -> Arc<Self> {
        Arc::new(Self {
            reply: Reply::NoSpawn,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn timing_out_then(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Reply::TimeoutThen(text.to_string()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn sessions(&self) -> Vec<Option<SessionMode>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.session.clone())
            .collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl QueryRunner for FakeRunner {
    async fn run(&self, invocation: &QueryInvocation) -> Result<String, QueryError> {
        let run = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(invocation.clone());
            calls.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.reply {
            Reply::Text(ref text) => Ok(text.clone()),
            Reply::Fail => Err(QueryError::Exit {
                code: Some(1),
                stderr: "model overloaded".into(),
            }),
            Reply::NoSpawn => Err(QueryError::Spawn("No such file or directory".into())),
            Reply::TimeoutThen(_) if run == 1 => Err(QueryError::Timeout(Duration::from_secs(120))),
            Reply::TimeoutThen(ref text) => Ok(text.clone()),
        }
    }
}

/// Forwards every event to a channel, optionally failing afterwards.
pub struct FakeNotifier {
    events: mpsc::UnboundedSender<CallEvent>,
    fail: bool,
}

impl FakeNotifier {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        Self::build(false)
    }

    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        Self::build(true)
    }

    fn build(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events, fail }), rx)
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, event: &CallEvent) -> Result<(), CallError> {
        let _ = self.events.send(event.clone());
        if self.fail {
            return Err(CallError::Notification("webhook returned 503".into()));
        }
        Ok(())
    }
}

fn device(id: &str, name: &str) -> DeviceProfile {
    DeviceProfile {
        id: id.to_string(),
        name: name.to_string(),
        voice: "nova".to_string(),
        prompt: None,
    }
}

/// Controller wired to fakes, routing 9000 → Morpheus and 9001 → Trinity.
pub fn call_controller(
    script: Vec<Say>,
    hooks: &[DtmfHookConfig],
    capture_timeout: Duration,
) -> (CallController, Arc<FakeMedia>, mpsc::UnboundedReceiver<CallEvent>) {
    let forks = Arc::new(ForkRegistry::new("ws://test:3001", Duration::from_secs(1)));
    let media = FakeMedia::with_caller(forks.clone(), script);
    let (notifier, events) = FakeNotifier::new();
    let bridge = Arc::new(QuerySessionBridge::new(
        Arc::new(MemorySessionStore::new()),
        FakeRunner::replying("VOICE_RESPONSE: sure"),
        BridgeSettings::default(),
    ));
    let engine = ConversationEngine::new(
        Collaborators {
            media: media.clone(),
            forks,
            stt: FakeStt::new(),
            tts: Arc::new(FakeTts),
            brain: bridge,
            notifier: notifier.clone(),
        },
        ConversationSettings {
            capture_timeout,
            ..ConversationSettings::default()
        },
    );
    let router = DeviceRouter::new(
        vec![device("9000", "Morpheus"), device("9001", "Trinity")],
        None,
    );
    let controller = CallController::new(router, media.clone(), engine, notifier, hooks);
    (controller, media, events)
}
