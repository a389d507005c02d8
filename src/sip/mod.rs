//! Minimal SIP user agent over UDP.
//!
//! Answers INVITEs through the call controller and keeps one dialog per
//! Call-ID until the conversation ends. Only the UAS side of a dialog is
//! implemented: we never place calls, but we do send BYE when the engine
//! ends a call the caller has not already hung up.

pub mod message;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dashmap::DashMap;
use rsip::common::uri::param::Tag;
use rsip::headers::UntypedHeader;
use rsip::{Header, Method, Request, Response, SipMessage, StatusCode, StatusCodeKind};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use self::message::ALLOW;
use crate::calling::controller::{CallController, InboundCall};
use crate::calling::CallHandle;

const MAX_DATAGRAM: usize = 65_507;

/// Server side of one INVITE dialog.
struct Dialog {
    peer: SocketAddr,
    invite: Request,
    local_tag: Tag,
    /// Last response sent for the INVITE, resent on retransmission.
    last_response: Mutex<Option<Response>>,
    handle: Mutex<Option<CallHandle>>,
    cancelled: AtomicBool,
    remote_bye: AtomicBool,
}

impl Dialog {
    fn last_response(&self) -> Option<Response> {
        self.last_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_last_response(&self, response: &Response) {
        *self.last_response.lock().unwrap_or_else(|e| e.into_inner()) = Some(response.clone());
    }

    fn handle(&self) -> Option<CallHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn answered(&self) -> bool {
        self.last_response()
            .is_some_and(|r| !matches!(r.status_code.kind(), StatusCodeKind::Provisional))
    }
}

pub struct SipServer {
    socket: Arc<UdpSocket>,
    controller: Arc<CallController>,
    dialogs: DashMap<String, Arc<Dialog>>,
    /// `host:port` advertised in Contact and Via.
    advertised: String,
}

impl SipServer {
    pub fn new(
        socket: UdpSocket,
        controller: Arc<CallController>,
        public_host: Option<&str>,
    ) -> Result<Self> {
        let local = socket.local_addr().context("SIP socket has no local address")?;
        let host = public_host
            .map(str::to_string)
            .unwrap_or_else(|| local.ip().to_string());
        Ok(Self {
            socket: Arc::new(socket),
            controller,
            dialogs: DashMap::new(),
            advertised: format!("{}:{}", host, local.port()),
        })
    }

    pub fn active_dialogs(&self) -> usize {
        self.dialogs.len()
    }

    /// Receive loop. Returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("SIP listening on {}", self.socket.local_addr()?);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("SIP receive failed: {}", e);
                        continue;
                    }
                },
            };
            match SipMessage::try_from(&buf[..len]) {
                Ok(SipMessage::Request(req)) => self.clone().on_request(req, peer).await,
                Ok(SipMessage::Response(resp)) => {
                    tracing::debug!("SIP {} from {}", resp.status_code, peer)
                }
                Err(e) => tracing::debug!("Dropping unparseable datagram from {}: {}", peer, e),
            }
        }
        if self.active_dialogs() > 0 {
            tracing::info!("Hanging up {} active call(s)", self.active_dialogs());
        }
        for dialog in self.dialogs.iter() {
            if let Some(handle) = dialog.handle() {
                handle.hang_up();
            }
        }
        Ok(())
    }

    async fn send(&self, text: String, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(text.as_bytes(), to).await {
            tracing::warn!("SIP send to {} failed: {}", to, e);
        }
    }

    async fn respond(&self, req: &Request, status: StatusCode, peer: SocketAddr) {
        self.send(message::response(req, status).to_string(), peer)
            .await;
    }

    async fn on_request(self: Arc<Self>, req: Request, peer: SocketAddr) {
        let Some(call_id) = message::call_id(&req) else {
            self.respond(&req, StatusCode::BadRequest, peer).await;
            return;
        };
        tracing::debug!("SIP {} {} from {}", req.method, call_id, peer);

        match req.method {
            Method::Invite => self.on_invite(req, call_id, peer).await,
            Method::Ack => {}
            Method::Bye => {
                let Some(dialog) = self.dialogs.get(&call_id).map(|d| d.value().clone()) else {
                    self.respond(&req, StatusCode::CallTransactionDoesNotExist, peer)
                        .await;
                    return;
                };
                dialog.remote_bye.store(true, Ordering::SeqCst);
                self.respond(&req, StatusCode::OK, peer).await;
                tracing::info!("SIP {}: caller hung up", call_id);
                if let Some(handle) = dialog.handle() {
                    handle.hang_up();
                }
            }
            Method::Cancel => {
                let dialog = self.dialogs.get(&call_id).map(|d| d.value().clone());
                match dialog {
                    Some(dialog) if !dialog.answered() => {
                        self.respond(&req, StatusCode::OK, peer).await;
                        dialog.cancelled.store(true, Ordering::SeqCst);
                        let terminated = message::with_to_tag(
                            message::response(&dialog.invite, StatusCode::RequestTerminated),
                            &dialog.local_tag,
                        );
                        dialog.set_last_response(&terminated);
                        self.send(terminated.to_string(), dialog.peer).await;
                        if let Some(handle) = dialog.handle() {
                            handle.hang_up();
                        }
                        tracing::info!("SIP {}: cancelled by caller", call_id);
                    }
                    _ => {
                        self.respond(&req, StatusCode::CallTransactionDoesNotExist, peer)
                            .await
                    }
                }
            }
            Method::Options => {
                let mut resp = message::response(&req, StatusCode::OK);
                resp.headers
                    .push(Header::Allow(rsip::headers::Allow::new(ALLOW)));
                self.send(resp.to_string(), peer).await;
            }
            _ => self.respond(&req, StatusCode::NotImplemented, peer).await,
        }
    }

    async fn on_invite(self: Arc<Self>, req: Request, call_id: String, peer: SocketAddr) {
        if let Some(dialog) = self.dialogs.get(&call_id).map(|d| d.value().clone()) {
            // Retransmission (or re-INVITE, which we do not support).
            if let Some(resp) = dialog.last_response() {
                self.send(resp.to_string(), peer).await;
            }
            return;
        }

        let trying = message::response(&req, StatusCode::Trying);
        let dialog = Arc::new(Dialog {
            peer,
            invite: req,
            local_tag: Tag::default(),
            last_response: Mutex::new(Some(trying.clone())),
            handle: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            remote_bye: AtomicBool::new(false),
        });
        self.dialogs.insert(call_id.clone(), dialog.clone());
        self.send(trying.to_string(), peer).await;

        tokio::spawn(async move {
            self.answer(&call_id, &dialog).await;
            self.dialogs.remove(&call_id);
        });
    }

    async fn answer(&self, call_id: &str, dialog: &Dialog) {
        let invite = &dialog.invite;
        let inbound = InboundCall {
            from: message::from_value(invite),
            to: message::to_value(invite),
            sdp: message::body_text(invite),
        };

        let accepted = match self.controller.accept_call(&inbound).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("SIP {}: rejecting call: {}", call_id, e);
                if !dialog.cancelled.load(Ordering::SeqCst) {
                    let reject = message::with_to_tag(
                        message::response(invite, StatusCode::NotAcceptableHere),
                        &dialog.local_tag,
                    );
                    dialog.set_last_response(&reject);
                    self.send(reject.to_string(), dialog.peer).await;
                }
                return;
            }
        };

        let handle = accepted.handle.clone();
        *dialog.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());
        if dialog.cancelled.load(Ordering::SeqCst) {
            handle.hang_up();
        } else {
            let mut ok = message::with_sdp(
                message::with_to_tag(message::response(invite, StatusCode::OK), &dialog.local_tag),
                &accepted.local_sdp,
            );
            ok.headers.push(Header::Contact(rsip::headers::Contact::new(format!(
                "<sip:voxgate@{}>",
                self.advertised
            ))));
            ok.headers
                .push(Header::Allow(rsip::headers::Allow::new(ALLOW)));
            dialog.set_last_response(&ok);
            self.send(ok.to_string(), dialog.peer).await;
            tracing::info!("SIP {}: answered as media call {}", call_id, handle.id());
        }

        let outcome = self.controller.run_call(accepted).await;
        tracing::info!(
            "SIP {}: call ended ({:?}, {} turns)",
            call_id,
            outcome.reason,
            outcome.turns
        );

        if dialog.remote_bye.load(Ordering::SeqCst) || dialog.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.send_bye(call_id, dialog).await;
    }

    async fn send_bye(&self, call_id: &str, dialog: &Dialog) {
        let bye = match message::bye(&dialog.invite, &dialog.local_tag, &self.advertised, 1) {
            Ok(bye) => bye,
            Err(e) => {
                tracing::warn!("SIP {}: cannot build BYE: {:#}", call_id, e);
                return;
            }
        };
        let target = message::uri_addr(&bye.uri).unwrap_or(dialog.peer);
        tracing::info!("SIP {}: sending BYE to {}", call_id, target);
        self.send(bye.to_string(), target).await;
    }
}
