//! Configuration loading

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::routing::DeviceProfile;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub fork: ForkConfig,
    pub media: MediaConfig,
    pub bridge: BridgeConfig,
    pub conversation: ConversationConfig,
    pub stt: SpeechServiceConfig,
    pub tts: SpeechServiceConfig,
    pub notify: NotifyConfig,
    /// Routing table, keyed by dialed extension.
    pub devices: Vec<DeviceProfile>,
    /// Profile used when nothing in `devices` matches.
    pub default_device: Option<DeviceProfile>,
    /// Per-caller DTMF injection hooks (empty unless configured).
    pub dtmf_hooks: Vec<DtmfHookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// UDP address the SIP listener binds to.
    pub bind: String,
    /// Host (or host:port) advertised in Contact/Via headers.
    pub public_host: Option<String>,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5060".to_string(),
            public_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// TCP address the fork WebSocket listener binds to.
    pub listen: String,
    /// Base URL the media layer connects back to (ws://host:port).
    pub public_url: String,
    pub connect_timeout_secs: u64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3001".to_string(),
            public_url: "ws://127.0.0.1:3001".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl ForkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// REST base URL of the media server control API.
    pub api_url: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8088".to_string(),
        }
    }
}

/// Where the conversation engine sends its queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Run the bridge in-process and spawn the LLM CLI directly.
    Local,
    /// Talk to a bridge running elsewhere over HTTP.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    /// Base URL of a remote bridge (mode = "remote").
    pub url: String,
    /// Address the bridge HTTP surface binds to.
    pub listen: String,
    /// LLM CLI executable.
    pub command: String,
    pub model: Option<String>,
    /// Upper bound on agentic turns inside one query.
    pub max_turns: u32,
    /// Wall-clock limit for one subprocess invocation.
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: BridgeMode::Local,
            url: "http://127.0.0.1:3333".to_string(),
            listen: "127.0.0.1:3333".to_string(),
            command: "claude".to_string(),
            model: None,
            max_turns: 3,
            timeout_secs: 120,
        }
    }
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_turns: u32,
    pub capture_timeout_secs: u64,
    pub hold_music_url: Option<String>,
    pub ready_cue_url: Option<String>,
    pub got_it_cue_url: Option<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            capture_timeout_secs: 30,
            hold_music_url: None,
            ready_cue_url: None,
            got_it_cue_url: None,
        }
    }
}

/// OpenAI-compatible speech endpoint (used for both STT and TTS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for SpeechServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving call start/end events. Unset disables notifications.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

/// One row of the DTMF hook table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfHookConfig {
    pub caller_id: String,
    #[serde(default)]
    pub delay_ms: u64,
    pub tones: String,
    #[serde(default)]
    pub post_delay_ms: u64,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "voxgate", "voxgate")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`, or from the platform config directory.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.conversation.max_turns, 20);
        assert_eq!(config.conversation.capture_timeout_secs, 30);
        assert_eq!(config.fork.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.bridge.max_turns, 3);
        assert_eq!(config.bridge.mode, BridgeMode::Local);
        assert_eq!(config.notify.timeout_secs, 5);
        assert!(config.devices.is_empty());
        assert!(config.dtmf_hooks.is_empty());
    }

    #[test]
    fn test_parse_devices_and_hooks() {
        let toml = r#"
            [bridge]
            mode = "remote"
            url = "http://bridge:3333"

            [[devices]]
            id = "9000"
            name = "Morpheus"
            voice = "onyx"
            prompt = "You are Morpheus."

            [[devices]]
            id = "9001"
            name = "Trinity"
            voice = "nova"

            [default_device]
            id = "default"
            name = "Assistant"
            voice = "alloy"

            [[dtmf_hooks]]
            caller_id = "+15551234567"
            delay_ms = 1500
            tones = "1"
            post_delay_ms = 500
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.bridge.mode, BridgeMode::Remote);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].prompt.as_deref(), Some("You are Morpheus."));
        assert!(config.devices[1].prompt.is_none());
        assert_eq!(config.default_device.unwrap().voice, "alloy");
        assert_eq!(config.dtmf_hooks[0].delay_ms, 1500);
        assert_eq!(config.dtmf_hooks[0].tones, "1");
    }

    #[test]
    fn test_rejects_unknown_bridge_mode() {
        assert_err!(Config::parse("[bridge]\nmode = \"cloud\""));
        assert_ok!(Config::parse("[bridge]\nmode = \"remote\""));
    }
}
