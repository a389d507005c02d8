//! Call controller: turns an inbound INVITE into a running conversation.
//!
//! Acceptance: identify the caller, route the dialed extension to a device
//! profile, sanitize the offer and negotiate with the media layer. Running:
//! optional per-caller DTMF hook, the conversation, then endpoint teardown.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use super::media::MediaLayer;
use super::routing::{DeviceRouter, RouteMatch};
use super::{sdp, Call, CallHandle};
use crate::config::DtmfHookConfig;
use crate::conversation::{ConversationEngine, ConversationOutcome};
use crate::error::CallError;
use crate::notify::{self, CallEvent, Notifier};

/// Caller id used when the From header carries no user part.
pub const UNKNOWN_CALLER: &str = "unknown";

/// The parts of an INVITE the controller cares about.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub from: String,
    pub to: String,
    pub sdp: String,
}

/// A negotiated call, ready to run.
#[derive(Debug)]
pub struct AcceptedCall {
    pub call: Call,
    pub handle: CallHandle,
    /// SDP answer to send back to the caller.
    pub local_sdp: String,
}

/// Tones sent to a specific caller shortly after answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtmfHook {
    pub delay: Duration,
    pub tones: String,
    pub post_delay: Duration,
}

impl From<&DtmfHookConfig> for DtmfHook {
    fn from(config: &DtmfHookConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
            tones: config.tones.clone(),
            post_delay: Duration::from_millis(config.post_delay_ms),
        }
    }
}

fn uri_user() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)sips?:([^@>;:\s]+)@").expect("static regex"))
}

/// User part of a From header; `unknown` if there is none.
pub fn parse_caller_id(from: &str) -> String {
    uri_user()
        .captures(from)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| UNKNOWN_CALLER.to_string())
}

/// Dialed extension from a To header. Trunk calls may carry none.
pub fn parse_dialed(to: &str) -> Option<String> {
    uri_user().captures(to).map(|c| c[1].to_string())
}

pub struct CallController {
    router: DeviceRouter,
    media: Arc<dyn MediaLayer>,
    engine: ConversationEngine,
    notifier: Arc<dyn Notifier>,
    dtmf_hooks: HashMap<String, DtmfHook>,
}

impl CallController {
    pub fn new(
        router: DeviceRouter,
        media: Arc<dyn MediaLayer>,
        engine: ConversationEngine,
        notifier: Arc<dyn Notifier>,
        hooks: &[DtmfHookConfig],
    ) -> Self {
        let dtmf_hooks = hooks
            .iter()
            .map(|h| (h.caller_id.clone(), DtmfHook::from(h)))
            .collect();
        Self {
            router,
            media,
            engine,
            notifier,
            dtmf_hooks,
        }
    }

    /// Negotiate media for an inbound call.
    ///
    /// Only negotiation can fail; identity and routing always resolve.
    pub async fn accept_call(&self, inbound: &InboundCall) -> Result<AcceptedCall, CallError> {
        let caller_id = parse_caller_id(&inbound.from);
        let dialed = parse_dialed(&inbound.to);

        let (device, how) = self.router.resolve(dialed.as_deref());
        match how {
            RouteMatch::Exact => {
                tracing::info!("Call from {}: extension {} -> '{}'", caller_id, device.id, device.name)
            }
            RouteMatch::FirstConfigured => tracing::info!(
                "Call from {}: no extension dialed, using first device '{}'",
                caller_id,
                device.name
            ),
            RouteMatch::Default => tracing::info!(
                "Call from {}: extension {:?} not configured, using default device '{}'",
                caller_id,
                dialed,
                device.name
            ),
        }
        let device = device.clone();

        if sdp::has_video(&inbound.sdp) {
            tracing::debug!("Dropping video from offer by {}", caller_id);
        }
        let offer = sdp::strip_video(&inbound.sdp);
        let endpoint = self.media.create_endpoint(&offer).await.map_err(|e| match e {
            CallError::MediaNegotiation(_) => e,
            other => CallError::MediaNegotiation(other.to_string()),
        })?;

        let mut call = Call::new(endpoint.uuid.clone(), caller_id, dialed, device);
        call.default_device = how == RouteMatch::Default;
        let handle = CallHandle::new(endpoint.uuid, self.media.clone());
        tracing::info!("Call {}: accepted from {}", call.id, call.caller_id);

        notify::dispatch(&self.notifier, CallEvent::started(&call));

        Ok(AcceptedCall {
            call,
            handle,
            local_sdp: endpoint.sdp,
        })
    }

    /// Run the conversation to completion and release the endpoint.
    pub async fn run_call(&self, accepted: AcceptedCall) -> ConversationOutcome {
        let AcceptedCall {
            mut call, handle, ..
        } = accepted;

        if let Some(hook) = self.dtmf_hooks.get(&call.caller_id) {
            self.run_dtmf_hook(&call, &handle, hook).await;
        }

        let outcome = self.engine.run(&mut call, &handle).await;
        handle.destroy().await;
        outcome
    }

    async fn run_dtmf_hook(&self, call: &Call, handle: &CallHandle, hook: &DtmfHook) {
        tokio::select! {
            _ = handle.hung_up() => return,
            _ = tokio::time::sleep(hook.delay) => {}
        }
        tracing::info!("Call {}: sending DTMF {}", call.id, hook.tones);
        if let Err(e) = self.media.send_dtmf(&call.id, &hook.tones).await {
            tracing::warn!("Call {}: DTMF failed: {}", call.id, e);
        }
        tokio::select! {
            _ = handle.hung_up() => {}
            _ = tokio::time::sleep(hook.post_delay) => {}
        }
    }
}
