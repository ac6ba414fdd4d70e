//! Audio capture, playback, and the shared frame type
//!
//! Capture delivers fixed 20ms PCM frames from the microphone; playback is
//! blocking and sequential so queued speech comes out in order.

mod capture;
mod playback;

pub use capture::FrameSource;
pub use playback::{AudioPlayback, AudioSink, decode_mp3};

use crate::{Error, Result};

/// Sample rate for capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16_000;

/// Capture frame duration in milliseconds
pub const FRAME_MS: u32 = 20;

/// Samples per capture frame (20ms at 16kHz)
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

/// Playback sample rate (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// One fixed-duration block of mono PCM plus its precomputed loudness.
///
/// Produced by the real-time capture callback, consumed exactly once by the
/// voice-activity gate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// 16-bit signed mono samples, always [`FRAME_SAMPLES`] long
    pub samples: Vec<i16>,
    /// RMS amplitude normalized to 0..1
    pub amplitude: f32,
}

impl AudioFrame {
    /// Wrap a sample block, computing its RMS amplitude
    #[must_use]
    pub fn from_samples(samples: Vec<i16>) -> Self {
        let amplitude = rms_i16(&samples);
        Self { samples, amplitude }
    }
}

/// RMS energy of i16 samples, normalized to 0..1
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let f = f32::from(s) / 32768.0;
            f * f
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// RMS energy of f32 samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_f32(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
