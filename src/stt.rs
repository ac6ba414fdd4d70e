//! Speech-to-text: lazy engine lifecycle, signal conditioning, and
//! hallucination post-filtering
//!
//! The engine is constructed at most once under a lock no matter how many
//! callers race into [`TranscriptionService::ensure_loaded`]. Transcription
//! itself never returns an error to the turn: engine unavailability degrades
//! to a sentinel phrase the caller can speak, and everything else degrades to
//! an empty string.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE, samples_to_wav};
use crate::config::SttConfig;
use crate::vad::SpeechSession;
use crate::{Error, Result};

/// Spoken/displayed when the engine cannot be constructed
pub const STT_OFFLINE_MESSAGE: &str = "Sorry, my speech recognition is offline.";

/// Peak amplitude below which a session is considered inaudible
const AUDIBILITY_THRESHOLD: f32 = 0.01;

/// Fraction of energy removed from noise-classified windows
const NOISE_ATTENUATION: f32 = 0.6;

/// Short boilerplate phrases Whisper-family models hallucinate on near-silence
const HALLUCINATED_PHRASES: &[&str] =
    &["Thank you.", "Thanks for watching!", "You", "Bye.", ".", "MBC"];

/// Speech-to-text inference backend
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Transcribe WAV audio to text
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// OpenAI-compatible `audio/transcriptions` client.
///
/// Decoding is pinned deterministic (temperature 0) with no cross-segment
/// context conditioning, and the server-side VAD filter is enabled as a
/// second safety net. The VAD/context fields are faster-whisper server
/// extensions; OpenAI-compatible servers that do not know them ignore them.
pub struct WhisperApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl WhisperApi {
    /// Create a client from config
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is missing
    pub fn new(config: &SttConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::Config("stt.base_url is required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SttEngine for WhisperApi {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TranscriptionResponse {
            text: String,
        }

        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", "en")
            .text("temperature", "0")
            .text("vad_filter", "true")
            .text("condition_on_previous_text", "false");

        let url = format!("{}/audio/transcriptions", self.base_url);
        let mut request = self.client.post(&url).multipart(form);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            Error::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription error {status}: {body}")));
        }

        let result: TranscriptionResponse = response.json().await?;
        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

/// Owns the STT engine lifecycle and the per-session conditioning pipeline
pub struct TranscriptionService {
    config: SttConfig,
    engine: Mutex<Option<Arc<dyn SttEngine>>>,
}

impl TranscriptionService {
    /// Create a service that will lazily construct a [`WhisperApi`] engine
    #[must_use]
    pub fn new(config: SttConfig) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
        }
    }

    /// Create a service over a pre-built engine (tests, alternative backends)
    #[must_use]
    pub fn with_engine(engine: Arc<dyn SttEngine>) -> Self {
        Self {
            config: SttConfig::default(),
            engine: Mutex::new(Some(engine)),
        }
    }

    /// Get the engine, constructing it on first call. Concurrent callers are
    /// serialized by the lock; the construction path runs at most once.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be constructed
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn SttEngine>> {
        let mut guard = self.engine.lock().await;
        if let Some(engine) = guard.as_ref() {
            return Ok(Arc::clone(engine));
        }

        tracing::info!(base_url = %self.config.base_url, model = %self.config.model, "loading STT engine");
        let engine: Arc<dyn SttEngine> = Arc::new(WhisperApi::new(&self.config)?);
        *guard = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Transcribe a finalized session.
    ///
    /// Never fails: engine unavailability yields [`STT_OFFLINE_MESSAGE`],
    /// inaudible audio and filtered hallucinations yield an empty string.
    pub async fn transcribe(&self, session: &SpeechSession) -> String {
        let engine = match self.ensure_loaded().await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "STT engine unavailable");
                return STT_OFFLINE_MESSAGE.to_string();
            }
        };

        let mut samples: Vec<f32> = session
            .samples()
            .iter()
            .map(|&s| f32::from(s) / 32768.0)
            .collect();

        suppress_noise(&mut samples);

        let peak = peak_amplitude(&samples);
        if peak < AUDIBILITY_THRESHOLD {
            tracing::debug!(peak, "audio too quiet, ignoring");
            return String::new();
        }
        normalize_peak(&mut samples, peak);

        let wav = match samples_to_wav(&samples, SAMPLE_RATE) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::error!(error = %e, "WAV encoding failed");
                return String::new();
            }
        };

        match engine.transcribe(&wav).await {
            Ok(text) => filter_transcript(text.trim()),
            Err(e) => {
                tracing::error!(error = %e, "transcription failed");
                String::new()
            }
        }
    }
}

/// Strip exact-match hallucinated boilerplate and sub-2-character results
fn filter_transcript(text: &str) -> String {
    if text.chars().count() < 2 || HALLUCINATED_PHRASES.contains(&text) {
        tracing::debug!(text, "transcript filtered");
        return String::new();
    }
    text.to_string()
}

/// Peak absolute amplitude
fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

/// Scale to unit peak
fn normalize_peak(samples: &mut [f32], peak: f32) {
    let scale = 1.0 / (peak + 1e-6);
    for s in samples.iter_mut() {
        *s *= scale;
    }
}

/// Frame-granularity noise suppression.
///
/// Estimates the noise floor from the quietest decile of 20ms windows and
/// attenuates windows near that floor by [`NOISE_ATTENUATION`], so steady
/// background hiss does not dominate the peak-normalization step.
fn suppress_noise(samples: &mut [f32]) {
    let window = FRAME_SAMPLES;
    if samples.len() < window * 4 {
        return;
    }

    let energies: Vec<f32> = samples
        .chunks(window)
        .map(crate::audio::rms_f32)
        .collect();

    let mut sorted = energies.clone();
    sorted.sort_by(f32::total_cmp);
    let floor = sorted[sorted.len() / 10];
    let gate = (floor * 2.0).max(1e-4);

    for (chunk, energy) in samples.chunks_mut(window).zip(energies) {
        if energy < gate {
            for s in chunk.iter_mut() {
                *s *= 1.0 - NOISE_ATTENUATION;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hallucinated_phrases_are_stripped() {
        assert_eq!(filter_transcript("Thank you."), "");
        assert_eq!(filter_transcript("MBC"), "");
        assert_eq!(filter_transcript("."), "");
        assert_eq!(filter_transcript("x"), "");
        assert_eq!(filter_transcript(""), "");
        assert_eq!(filter_transcript("Thank you kindly."), "Thank you kindly.");
        assert_eq!(filter_transcript("hi"), "hi");
    }

    #[test]
    fn quiet_windows_are_attenuated_loud_ones_kept() {
        // 8 windows of hiss, 8 windows of signal
        let mut samples = vec![0.001f32; FRAME_SAMPLES * 8];
        samples.extend(vec![0.5f32; FRAME_SAMPLES * 8]);
        suppress_noise(&mut samples);

        assert!(samples[0].abs() < 0.001);
        assert!((samples[FRAME_SAMPLES * 8] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn normalization_reaches_unit_peak() {
        let mut samples = vec![0.0f32, 0.25, -0.5];
        let peak = peak_amplitude(&samples);
        normalize_peak(&mut samples, peak);
        let new_peak = peak_amplitude(&samples);
        assert!((new_peak - 1.0).abs() < 0.01);
    }
}
