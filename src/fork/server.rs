//! WebSocket listener for audio fork channels.
//!
//! The media layer connects to `/fork/{uuid}` once a fork is started. Binary
//! frames carry PCM; text frames carry `ForkEvent`s. Capture toggles travel
//! the other way as JSON text frames.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{ForkControl, ForkEvent, ForkRegistry};

/// Extract the call UUID from a fork channel path.
pub fn call_id_from_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix("/fork/")?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

/// Accept fork connections until `shutdown` fires.
pub async fn run(
    listener: TcpListener,
    registry: Arc<ForkRegistry>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(
        "Audio fork listener on {}",
        listener.local_addr().context("Fork listener has no address")?
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Fork listener accept error: {:#}", e);
                        continue;
                    }
                };
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, registry).await {
                        tracing::warn!("Fork connection from {} failed: {:#}", peer, e);
                    }
                });
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Audio fork listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ForkRegistry>,
) -> Result<()> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await
    .context("Fork WebSocket handshake failed")?;

    let (mut sink, mut frames) = ws.split();

    let Some(call_id) = call_id_from_path(&path).map(str::to_string) else {
        tracing::warn!("Fork connection from {} on unknown path {}", peer, path);
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    };

    let Some((session, mut control_rx)) = registry.attach(&call_id) else {
        tracing::warn!("Call {}: unexpected fork connection from {}", call_id, peer);
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    };

    tracing::info!(
        "Call {}: audio fork connected from {} (capture {}, {} active)",
        call_id,
        peer,
        if session.is_capture_enabled() { "on" } else { "off" },
        registry.active_count()
    );

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Binary(data))) => session.push_audio(&data),
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ForkEvent>(&text) {
                    Ok(ForkEvent::SpeechEnd) => session.end_of_speech(),
                    Ok(ForkEvent::SpeechStart) => {
                        tracing::debug!("Call {}: speech started", call_id);
                    }
                    Ok(ForkEvent::Stop) => {
                        tracing::info!("Call {}: far end stopped the fork", call_id);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("Call {}: ignoring fork text frame: {}", call_id, text);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Call {}: fork closed: {:?}", call_id, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Call {}: fork receive error: {:#}", call_id, e);
                    break;
                }
                None => break,
            },
            control = control_rx.recv() => match control {
                Some(ForkControl::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(ctl) => {
                    if let Some(json) = ctl.to_json() {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            tracing::warn!("Call {}: failed to send fork control: {:#}", call_id, e);
                        }
                    }
                }
            },
        }
    }

    registry.detach(&call_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMedia;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_call_id_from_path() {
        assert_eq!(call_id_from_path("/fork/abc-123"), Some("abc-123"));
        assert_eq!(call_id_from_path("/fork/abc-123/"), Some("abc-123"));
        assert_eq!(call_id_from_path("/fork/"), None);
        assert_eq!(call_id_from_path("/fork/a/b"), None);
        assert_eq!(call_id_from_path("/other/abc"), None);
    }

    #[tokio::test]
    async fn test_fork_channel_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(ForkRegistry::new(
            &format!("ws://{}", addr),
            Duration::from_secs(2),
        ));
        let shutdown = CancellationToken::new();
        tokio::spawn(run(listener, registry.clone(), shutdown.clone()));

        // Media layer side: connect back once the fork is requested.
        let far_end = tokio::spawn(async move {
            let url = format!("ws://{}/fork/call-1", addr);
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if let Ok((ws, _)) = connect_async(&url).await {
                    return ws;
                }
            }
        });

        let media = FakeMedia::new();
        let session = registry.start("call-1", media.as_ref()).await.unwrap();
        let mut ws = far_end.await.unwrap();

        session.set_capture_enabled(true);
        let control = ws.next().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&control.into_text().unwrap()).unwrap(),
            serde_json::json!({ "type": "capture", "enabled": true })
        );

        ws.send(Message::Binary(vec![1, 0, 2, 0])).await.unwrap();
        ws.send(Message::Text(r#"{"type":"speech_end"}"#.into()))
            .await
            .unwrap();

        let utterance = session
            .wait_for_utterance(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(utterance.audio, vec![1, 0, 2, 0]);

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if registry.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.active_count(), 0);
        shutdown.cancel();
    }
}
