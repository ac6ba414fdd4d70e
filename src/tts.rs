//! Text-to-speech synthesis backends

use async_trait::async_trait;

use crate::audio::decode_mp3;
use crate::config::TtsConfig;
use crate::{Error, Result};

/// Text-to-speech inference backend.
///
/// Returns synthesized audio as an ordered sequence of sample chunks at the
/// playback sample rate. A backend that produces one buffer per request
/// returns a single chunk; chunked backends let playback start earlier.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize speech for `text` in the given voice
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<Vec<f32>>>;
}

/// OpenAI-compatible `audio/speech` client. Requests MP3 and decodes it to
/// a single chunk of mono f32 samples.
pub struct OpenAiTts {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    speed: f32,
}

impl OpenAiTts {
    /// Create a client from config
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is missing
    pub fn new(config: &TtsConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::Config("tts.base_url is required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            speed: config.speed,
        })
    }
}

#[async_trait]
impl TtsEngine for OpenAiTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<Vec<f32>>> {
        tracing::debug!(chars = text.len(), voice, "starting speech synthesis");

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "speed": self.speed,
            "response_format": "mp3",
        });

        let url = format!("{}/audio/speech", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "speech synthesis request failed");
            Error::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "speech synthesis API error");
            return Err(Error::Tts(format!("synthesis error {status}: {body}")));
        }

        let mp3 = response.bytes().await?;
        let samples = decode_mp3(&mp3)?;
        tracing::debug!(samples = samples.len(), "synthesis complete");

        Ok(vec![samples])
    }
}
