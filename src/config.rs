//! Configuration for the voice pipeline
//!
//! Loaded from a TOML file (`~/.config/voxloop/config.toml` by default) with
//! environment variable overrides for secrets. Every field is optional in the
//! file — it is a partial overlay on top of the built-in defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Default system persona passed to the text-generation providers
const DEFAULT_PERSONA: &str = "You are Sophia, a friendly voice assistant. \
Respond naturally and keep replies short and conversational - they will be \
spoken aloud, so avoid lists, markdown, and emoji.";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// System persona prompt for text generation
    pub persona: String,

    /// Voice-activity gate tuning
    pub gate: GateSettings,

    /// Speech-to-text backend
    pub stt: SttConfig,

    /// Text-to-speech backend
    pub tts: TtsConfig,

    /// Text-generation providers (primary + fallback)
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            gate: GateSettings::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Voice-activity gate tuning, all durations in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// WebRTC VAD aggressiveness (0-3)
    pub vad_aggressiveness: u8,

    /// Silence duration that ends an utterance
    pub silence_ms: u32,

    /// Pre-speech rolling buffer retained to avoid clipping onsets
    pub pre_roll_ms: u32,

    /// Hard cap on one utterance
    pub max_utterance_ms: u32,

    /// Utterances shorter than this are discarded as noise
    pub min_utterance_ms: u32,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            vad_aggressiveness: 2,
            silence_ms: 1000,
            pre_roll_ms: 500,
            max_utterance_ms: 30_000,
            min_utterance_ms: 1000,
        }
    }
}

/// Speech-to-text backend configuration
///
/// Targets an OpenAI-compatible `audio/transcriptions` endpoint. The default
/// points at a local faster-whisper server, which accepts the extended VAD
/// filter parameters; `api_key` may be empty for local servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Base URL without trailing slash (e.g. `http://localhost:8000/v1`)
    pub base_url: String,

    /// Bearer API key; empty to skip the Authorization header
    pub api_key: String,

    /// Model identifier (e.g. "whisper-1", "large-v3-turbo")
    pub model: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: String::new(),
            model: "large-v3-turbo".to_string(),
        }
    }
}

/// Text-to-speech backend configuration (OpenAI-compatible `audio/speech`)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL without trailing slash
    pub base_url: String,

    /// Bearer API key
    pub api_key: String,

    /// Model identifier (e.g. "tts-1")
    pub model: String,

    /// Voice identifier (e.g. "alloy", "shimmer")
    pub voice: String,

    /// Speed multiplier (0.25 to 4.0)
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "tts-1".to_string(),
            voice: "shimmer".to_string(),
            speed: 1.0,
        }
    }
}

/// Text-generation configuration: ordered provider attempts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Primary remote provider
    pub primary: ProviderConfig,

    /// Local fallback provider, attempted when the primary fails
    pub fallback: ProviderConfig,

    /// Sampling temperature
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: ProviderConfig {
                name: "OpenRouter".to_string(),
                base_url: "https://openrouter.ai/api/v1".to_string(),
                api_key: String::new(),
                model: "moonshotai/kimi-k2:free".to_string(),
            },
            fallback: ProviderConfig {
                name: "LM Studio".to_string(),
                base_url: "http://localhost:1234/v1".to_string(),
                api_key: "lm-studio".to_string(),
                model: "google/gemma-3-4b".to_string(),
            },
            temperature: 0.7,
        }
    }
}

/// One OpenAI-compatible chat-completions endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Diagnostic name reported alongside responses
    pub name: String,

    /// Base URL without trailing slash
    pub base_url: String,

    /// Bearer API key
    pub api_key: String,

    /// Model identifier
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from the given path, or the platform config
    /// directory when none is given. A missing file yields the defaults.
    /// Environment variables override file-provided secrets afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&raw)?;
            tracing::debug!(path = %path.display(), "loaded config file");
            config
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Overlay secrets from the environment onto the loaded config
    fn apply_env_overrides(&mut self) {
        if let Some(key) = env_first(&["VOXLOOP_OPENROUTER_API_KEY", "OPENROUTER_API_KEY"]) {
            self.llm.primary.api_key = key;
        }
        if let Some(key) = env_first(&["VOXLOOP_STT_API_KEY", "OPENAI_API_KEY"]) {
            if self.stt.api_key.is_empty() {
                self.stt.api_key = key;
            }
        }
        if let Some(key) = env_first(&["VOXLOOP_TTS_API_KEY", "OPENAI_API_KEY"]) {
            if self.tts.api_key.is_empty() {
                self.tts.api_key = key;
            }
        }
    }
}

/// First non-empty value among the given environment variables
fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .find(|v| !v.is_empty())
}

/// Platform config file path (`~/.config/voxloop/config.toml` on Linux)
fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "omni", "voxloop")
        .ok_or_else(|| Error::Config("could not resolve config directory".to_string()))?;
    Ok(dirs.config_dir().join("config.toml"))
}
