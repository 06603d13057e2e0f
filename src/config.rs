use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ParleyError, Result};
use crate::persona::Persona;

const fn default_block_size() -> usize {
    4096
}

const fn default_volume_gain() -> f32 {
    5.0
}

const fn default_input_queue() -> usize {
    64
}

fn default_url() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash-native-audio-preview-09-2025".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_persona() -> String {
    "intake".to_string()
}

const fn default_outbound_queue() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Additional personas, appended after the built-in ones.
    #[serde(default)]
    pub personas: Vec<Persona>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_device: Option<String>,

    pub output_device: Option<String>,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Multiplier applied to block RMS before clamping to the [0,1] volume.
    #[serde(default = "default_volume_gain")]
    pub volume_gain: f32,

    /// Raw device callbacks buffered between the audio thread and the capture graph.
    #[serde(default = "default_input_queue")]
    pub input_queue: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            block_size: default_block_size(),
            volume_gain: default_volume_gain(),
            input_queue: default_input_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// What the capture graph does when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Discard the new frame; capture keeps its real-time pace.
    #[default]
    Drop,
    /// Wait for queue space on the capture graph thread.
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_persona")]
    pub default_persona: String,

    #[serde(default)]
    pub drop_policy: DropPolicy,

    /// Encoded frames allowed in flight towards the remote service.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_persona: default_persona(),
            drop_policy: DropPolicy::default(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ParleyError::Config(format!(
                "config file not found: {} (create it or pass --config with another path)",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            ParleyError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file at the default location, falling back to defaults when it
    /// does not exist.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("parley/config.yaml")
    }

    fn validate(&self) -> Result<()> {
        if self.audio.block_size == 0 {
            return Err(ParleyError::Config(
                "audio.block_size must be greater than zero".to_string(),
            ));
        }
        if self.session.outbound_queue == 0 {
            return Err(ParleyError::Config(
                "session.outbound_queue must be greater than zero".to_string(),
            ));
        }
        if self.audio.input_queue == 0 {
            return Err(ParleyError::Config(
                "audio.input_queue must be greater than zero".to_string(),
            ));
        }
        if !self.audio.volume_gain.is_finite() || self.audio.volume_gain < 0.0 {
            return Err(ParleyError::Config(format!(
                "audio.volume_gain must be a non-negative number, got {}",
                self.audio.volume_gain
            )));
        }
        Ok(())
    }
}
