//! Error taxonomy for a single call.
//!
//! Only `MediaNegotiation` rejects a call outright. Everything else is either
//! recovered inside the turn loop or ends the conversation with a spoken line.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// Signaling or SDP failure while accepting the call.
    #[error("media negotiation failed: {0}")]
    MediaNegotiation(String),

    /// A media-layer command (play, interrupt, fork, destroy) failed.
    #[error("media layer error: {0}")]
    Media(String),

    /// The fork channel did not connect within the bounded wait.
    #[error("audio fork did not connect within {0:?}")]
    ForkTimeout(std::time::Duration),

    /// The fork channel went away while a capture was pending.
    #[error("audio fork closed")]
    ForkClosed,

    /// A second concurrent `wait_for_utterance` on the same session.
    #[error("an utterance wait is already outstanding on this fork")]
    ForkBusy,

    #[error("no utterance captured within {0:?}")]
    CaptureTimeout(std::time::Duration),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("notification failed: {0}")]
    Notification(String),

    /// The remote party hung up (or the media layer destroyed the endpoint).
    #[error("call ended by remote party")]
    Hangup,
}

impl CallError {
    /// Errors that the turn loop recovers from without ending the call.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallError::CaptureTimeout(_) | CallError::Transcription(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recoverable_classification() {
        assert!(CallError::CaptureTimeout(Duration::from_secs(30)).is_recoverable());
        assert!(CallError::Transcription("x".into()).is_recoverable());
        assert!(!CallError::Hangup.is_recoverable());
        assert!(!CallError::ForkClosed.is_recoverable());
        assert!(!CallError::MediaNegotiation("488".into()).is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let e = CallError::ForkTimeout(Duration::from_secs(10));
        assert_eq!(e.to_string(), "audio fork did not connect within 10s");
    }
}
