//! Query session bridge: one LLM invocation per conversational turn, with
//! session continuity per call.
//!
//! The first query for a call UUID opens a new upstream session under a token
//! we generate; every later query for the same UUID resumes it. `ask` is the
//! outward surface: it never fails, substituting an apology on error.

pub mod client;
pub mod prompt;
pub mod runner;
pub mod server;
pub mod stream;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use self::runner::{QueryError, QueryInvocation, QueryRunner, SessionMode};

/// Spoken when a query fails for any reason.
pub const QUERY_FAILED_RESPONSE: &str =
    "I'm sorry, I ran into a problem working on that. Could you try asking again?";

/// Call UUID → upstream session token.
pub trait SessionStore: Send + Sync {
    fn get(&self, call_id: &str) -> Option<String>;
    fn set(&self, call_id: &str, token: String);
    /// Returns whether an entry existed.
    fn delete(&self, call_id: &str) -> bool;
    fn len(&self) -> usize;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, call_id: &str) -> Option<String> {
        self.sessions.get(call_id).map(|t| t.value().clone())
    }

    fn set(&self, call_id: &str, token: String) {
        self.sessions.insert(call_id.to_string(), token);
    }

    fn delete(&self, call_id: &str) -> bool {
        self.sessions.remove(call_id).is_some()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub call_id: Option<String>,
    pub device_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub text: String,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub prompt: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub device_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub success: bool,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub duration_ms: u64,
}

impl AskResponse {
    pub fn apology(duration_ms: u64) -> Self {
        Self {
            success: true,
            response: QUERY_FAILED_RESPONSE.to_string(),
            session_id: None,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: String,
    pub active_session_count: usize,
    pub model: String,
}

/// What the conversation engine needs from a bridge, local or remote.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Never fails; errors become an apology response.
    async fn ask(&self, request: AskRequest) -> AskResponse;

    /// Release the call's session. Idempotent.
    async fn end_session(&self, call_id: &str);
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub max_turns: u32,
    pub model: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_turns: 3,
            model: None,
        }
    }
}

pub struct QuerySessionBridge {
    store: Arc<dyn SessionStore>,
    runner: Arc<dyn QueryRunner>,
    settings: BridgeSettings,
}

impl QuerySessionBridge {
    pub fn new(
        store: Arc<dyn SessionStore>,
        runner: Arc<dyn QueryRunner>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    /// Run one query. Fails on spawn error, non-zero exit, or timeout.
    pub async fn query(
        &self,
        transcript: &str,
        opts: &QueryOptions,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();

        let session = opts
            .call_id
            .as_deref()
            .map(|call_id| match self.store.get(call_id) {
                Some(token) => SessionMode::Resume(token),
                None => SessionMode::New(uuid::Uuid::new_v4().to_string()),
            });

        match (&opts.call_id, &session) {
            (Some(call_id), Some(SessionMode::New(token))) => {
                tracing::info!("Call {}: starting new query session {}", call_id, token)
            }
            (Some(call_id), Some(SessionMode::Resume(token))) => {
                tracing::info!("Call {}: resuming query session {}", call_id, token)
            }
            _ => tracing::debug!("One-off query without session"),
        }

        let invocation = QueryInvocation {
            prompt: prompt::build(transcript, opts.device_prompt.as_deref()),
            session,
            max_turns: self.settings.max_turns,
            model: self.settings.model.clone(),
        };

        let raw = match self.runner.run(&invocation).await {
            Ok(raw) => raw,
            Err(e) => {
                // The process ran, so upstream may already hold the session.
                if let (Some(call_id), Some(SessionMode::New(token))) =
                    (&opts.call_id, &invocation.session)
                {
                    if !matches!(e, QueryError::Spawn(_)) {
                        self.store.set(call_id, token.clone());
                    }
                }
                return Err(e);
            }
        };
        let summary = stream::reduce(&raw);
        if summary.skipped > 0 {
            tracing::debug!("Skipped {} unparseable output lines", summary.skipped);
        }

        let session_id = match (&opts.call_id, &invocation.session) {
            (Some(call_id), Some(mode)) => {
                let token = summary
                    .session_id
                    .clone()
                    .unwrap_or_else(|| mode.token().to_string());
                self.store.set(call_id, token.clone());
                Some(token)
            }
            _ => summary.session_id.clone(),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Query finished in {}ms (cost {:?})",
            duration_ms,
            summary.cost_usd
        );

        Ok(QueryResponse {
            text: stream::response_text(&summary, &raw),
            duration_ms,
            session_id,
            cost_usd: summary.cost_usd,
        })
    }

    /// `query` with failures swallowed into an apology.
    pub async fn ask(&self, request: &AskRequest) -> AskResponse {
        let started = Instant::now();
        let opts = QueryOptions {
            call_id: request.call_id.clone(),
            device_prompt: request.device_prompt.clone(),
        };

        match self.query(&request.prompt, &opts).await {
            Ok(resp) => AskResponse {
                success: true,
                response: resp.text,
                session_id: resp.session_id,
                duration_ms: resp.duration_ms,
            },
            Err(e) => {
                tracing::error!(
                    "Query failed for call {}: {}",
                    request.call_id.as_deref().unwrap_or("-"),
                    e
                );
                AskResponse::apology(started.elapsed().as_millis() as u64)
            }
        }
    }

    /// Forget the call's session. Idempotent.
    pub fn end_session(&self, call_id: &str) {
        if self.store.delete(call_id) {
            tracing::info!("Call {}: query session ended", call_id);
        } else {
            tracing::debug!("Call {}: no query session to end", call_id);
        }
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok".to_string(),
            active_session_count: self.store.len(),
            model: self
                .settings
                .model
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        }
    }
}

#[async_trait]
impl QueryBackend for QuerySessionBridge {
    async fn ask(&self, request: AskRequest) -> AskResponse {
        QuerySessionBridge::ask(self, &request).await
    }

    async fn end_session(&self, call_id: &str) {
        QuerySessionBridge::end_session(self, call_id)
    }
}
