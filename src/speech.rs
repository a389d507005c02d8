//! Speech-to-text and text-to-speech collaborators.
//!
//! Both talk to OpenAI-compatible endpoints. Only the interface matters to the
//! conversation engine; provider details stay here.

use async_trait::async_trait;

use crate::config::SpeechServiceConfig;
use crate::error::CallError;

/// Sample rate of the capture path.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe mono s16le PCM.
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<String, CallError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render `text` with `voice`; returns WAV bytes.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, CallError>;
}

/// Wrap raw mono s16le PCM in a 44-byte WAV header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let channels: u16 = 1;
    let bits: u16 = 16;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits) / 8;
    let block_align = channels * bits / 8;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

pub struct HttpTranscriber {
    http: reqwest::Client,
    config: SpeechServiceConfig,
}

impl HttpTranscriber {
    pub fn new(config: SpeechServiceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<String, CallError> {
        let url = format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );
        let model = if self.config.model.is_empty() {
            "whisper-1".to_string()
        } else {
            self.config.model.clone()
        };

        let part = reqwest::multipart::Part::bytes(pcm_to_wav(pcm, sample_rate))
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| CallError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model)
            .text("response_format", "json");

        let mut req = self.http.post(&url).multipart(form);
        if let Some(ref key) = self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CallError::Transcription(format!("request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::Transcription(format!("{}: {}", status, body)));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CallError::Transcription(format!("bad response: {}", e)))?;
        Ok(body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

pub struct HttpSynthesizer {
    http: reqwest::Client,
    config: SpeechServiceConfig,
}

impl HttpSynthesizer {
    pub fn new(config: SpeechServiceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, CallError> {
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let model = if self.config.model.is_empty() {
            "tts-1"
        } else {
            self.config.model.as_str()
        };

        let mut req = self.http.post(&url).json(&serde_json::json!({
            "model": model,
            "voice": voice,
            "input": text,
            "response_format": "wav",
        }));
        if let Some(ref key) = self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CallError::Synthesis(format!("request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::Synthesis(format!("{}: {}", status, body)));
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| CallError::Synthesis(format!("failed to read audio: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let pcm = vec![0u8; 320];
        let wav = pcm_to_wav(&pcm, CAPTURE_SAMPLE_RATE);
        assert_eq!(wav.len(), 44 + 320);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 32_000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 320);
    }
}
