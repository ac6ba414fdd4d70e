//! Voice-activity-gated utterance capture
//!
//! Implements the listen → record → finish state machine over the 20ms frame
//! stream: a bounded pre-roll buffer avoids clipping utterance onsets, a
//! silence counter ends the utterance, and a hard duration cap bounds runaway
//! sessions. Frame classification sits behind [`SpeechDetector`] so the
//! production WebRTC VAD and scripted test detectors are interchangeable.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use webrtc_vad::{SampleRate as VadSampleRate, Vad, VadMode};

use crate::audio::{AudioFrame, FRAME_MS};
use crate::config::GateSettings;
use crate::stop::StopSignal;
use crate::{Error, Result};

/// Interval at which the capture loop re-checks the stop signal while no
/// frames are arriving
const STOP_POLL: Duration = Duration::from_millis(50);

/// Per-frame speech/non-speech classification
pub trait SpeechDetector {
    /// Classify one fixed-duration frame
    fn is_speech(&mut self, frame: &AudioFrame) -> bool;
}

impl SpeechDetector for Box<dyn SpeechDetector> {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        (**self).is_speech(frame)
    }
}

/// WebRTC VAD classifier, the production detector
pub struct WebRtcDetector {
    vad: Vad,
}

impl WebRtcDetector {
    /// Create a detector with the given aggressiveness (0-3)
    ///
    /// # Errors
    ///
    /// Returns error if aggressiveness is out of range
    pub fn new(aggressiveness: u8) -> Result<Self> {
        let mode = match aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(Error::Vad(format!(
                    "VAD aggressiveness must be 0-3, got {other}"
                )));
            }
        };

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(VadSampleRate::Rate16kHz);

        Ok(Self { vad })
    }
}

impl SpeechDetector for WebRtcDetector {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        // 20ms at 16kHz is a valid WebRTC VAD frame length; a malformed
        // frame is treated as non-speech rather than an error
        self.vad.is_voice_segment(&frame.samples).unwrap_or(false)
    }
}

/// RMS-threshold classifier, used by diagnostics and tests
pub struct EnergyDetector {
    threshold: f32,
}

impl EnergyDetector {
    /// Create a detector that classifies frames above `threshold` RMS as speech
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new(0.03)
    }
}

impl SpeechDetector for EnergyDetector {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        frame.amplitude > self.threshold
    }
}

/// Gate state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No speech seen yet; frames go to the bounded pre-roll buffer
    WaitingForSpeech,
    /// Speech confirmed; every frame is appended to the session
    Recording,
    /// Terminal: silence timeout, duration cap, or external stop
    Finished,
}

/// Gate thresholds, in frames
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Pre-speech rolling buffer capacity
    pub pre_roll_frames: usize,
    /// Consecutive silence frames that end an utterance
    pub silence_frames: usize,
    /// Hard cap on session length
    pub max_frames: usize,
    /// Sessions shorter than this are noise, not utterances
    pub min_frames: usize,
}

impl From<&GateSettings> for GateConfig {
    fn from(s: &GateSettings) -> Self {
        let per_frame = FRAME_MS;
        Self {
            pre_roll_frames: (s.pre_roll_ms / per_frame) as usize,
            silence_frames: (s.silence_ms / per_frame) as usize,
            max_frames: (s.max_utterance_ms / per_frame) as usize,
            min_frames: (s.min_utterance_ms / per_frame) as usize,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from(&GateSettings::default())
    }
}

/// Ordered frames collected for one utterance, including pre-roll and the
/// trailing silence that triggered the timeout (retained, not trimmed)
#[derive(Debug, Default)]
pub struct SpeechSession {
    frames: Vec<AudioFrame>,
    min_frames: usize,
}

impl SpeechSession {
    /// Build a session directly from frames (tests, replay tooling)
    #[must_use]
    pub fn from_frames(frames: Vec<AudioFrame>, min_frames: usize) -> Self {
        Self { frames, min_frames }
    }

    /// Number of collected frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if no speech was ever captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True if the session is long enough to be worth transcribing.
    /// Shorter sessions are noise and must not reach the model.
    #[must_use]
    pub fn is_long_enough(&self) -> bool {
        self.frames.len() > self.min_frames
    }

    /// Total captured duration in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.frames.len() as u64 * u64::from(FRAME_MS)
    }

    /// Concatenated samples of every frame, in order
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        let mut out = Vec::with_capacity(self.frames.len() * crate::audio::FRAME_SAMPLES);
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }
}

/// One-shot utterance capture gate. Construct per turn.
pub struct VoiceActivityGate<D: SpeechDetector> {
    detector: D,
    config: GateConfig,
    state: GateState,
    pre_roll: VecDeque<AudioFrame>,
    session: Vec<AudioFrame>,
    silent_frames: usize,
}

impl<D: SpeechDetector> VoiceActivityGate<D> {
    /// Create a gate over the given classifier and thresholds
    pub fn new(detector: D, config: GateConfig) -> Self {
        Self {
            detector,
            config,
            state: GateState::WaitingForSpeech,
            pre_roll: VecDeque::with_capacity(config.pre_roll_frames + 1),
            session: Vec::new(),
            silent_frames: 0,
        }
    }

    /// Current state machine position
    #[must_use]
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Feed one frame through the state machine, returning the new state
    pub fn push_frame(&mut self, frame: AudioFrame) -> GateState {
        match self.state {
            GateState::Finished => {}
            GateState::WaitingForSpeech => {
                if self.detector.is_speech(&frame) {
                    tracing::debug!("speech detected, recording");
                    self.session.extend(self.pre_roll.drain(..));
                    self.session.push(frame);
                    self.silent_frames = 0;
                    self.state = GateState::Recording;
                } else {
                    self.pre_roll.push_back(frame);
                    if self.pre_roll.len() > self.config.pre_roll_frames {
                        self.pre_roll.pop_front();
                    }
                }
            }
            GateState::Recording => {
                let is_speech = self.detector.is_speech(&frame);
                self.session.push(frame);

                if is_speech {
                    self.silent_frames = 0;
                } else {
                    self.silent_frames += 1;
                }

                if self.silent_frames > self.config.silence_frames {
                    tracing::debug!(frames = self.session.len(), "silence timeout");
                    self.state = GateState::Finished;
                } else if self.session.len() >= self.config.max_frames {
                    tracing::debug!(frames = self.session.len(), "max duration reached");
                    self.state = GateState::Finished;
                }
            }
        }
        self.state
    }

    /// Externally finish the gate (stop signal); idempotent
    pub fn finish(&mut self) {
        self.state = GateState::Finished;
    }

    /// Consume the gate, yielding whatever was recorded. Empty if speech
    /// never started; the caller decides whether it is long enough.
    #[must_use]
    pub fn into_session(self) -> SpeechSession {
        SpeechSession {
            frames: self.session,
            min_frames: self.config.min_frames,
        }
    }

    /// Pull frames until the utterance finishes or the stop signal fires.
    ///
    /// A stop while still waiting for speech yields an empty session - the
    /// caller must treat that as "no utterance", not an error. The stop
    /// signal is polled between frames, so cancellation latency is bounded
    /// by [`STOP_POLL`] when the frame stream stalls.
    pub async fn capture(
        mut self,
        frames: &mut mpsc::UnboundedReceiver<AudioFrame>,
        stop: &StopSignal,
        mut on_amplitude: impl FnMut(f32),
    ) -> SpeechSession {
        loop {
            if stop.is_set() {
                self.finish();
                break;
            }

            match tokio::time::timeout(STOP_POLL, frames.recv()).await {
                Ok(Some(frame)) => {
                    on_amplitude(frame.amplitude);
                    if self.push_frame(frame) == GateState::Finished {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::warn!("frame source closed during capture");
                    self.finish();
                    break;
                }
                Err(_) => {} // timeout: loop to re-check the stop signal
            }
        }

        self.into_session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;

    /// Detector scripted by a sequence of classifications
    struct Scripted(Vec<bool>, usize);

    impl Scripted {
        fn new(script: Vec<bool>) -> Self {
            Self(script, 0)
        }
    }

    impl SpeechDetector for Scripted {
        fn is_speech(&mut self, _frame: &AudioFrame) -> bool {
            let v = self.0.get(self.1).copied().unwrap_or(false);
            self.1 += 1;
            v
        }
    }

    fn frame() -> AudioFrame {
        AudioFrame::from_samples(vec![0i16; FRAME_SAMPLES])
    }

    fn config() -> GateConfig {
        GateConfig {
            pre_roll_frames: 25,
            silence_frames: 50,
            max_frames: 1500,
            min_frames: 50,
        }
    }

    #[test]
    fn all_silence_never_records() {
        let mut gate = VoiceActivityGate::new(Scripted::new(vec![false; 200]), config());
        for _ in 0..200 {
            assert_eq!(gate.push_frame(frame()), GateState::WaitingForSpeech);
        }
        let session = gate.into_session();
        assert!(session.is_empty());
        assert!(!session.is_long_enough());
    }

    #[test]
    fn pre_roll_is_bounded_and_seeds_the_session() {
        // 100 silence frames then speech: only the last 25 pre-roll frames
        // plus the speech frame survive
        let mut script = vec![false; 100];
        script.push(true);
        let mut gate = VoiceActivityGate::new(Scripted::new(script), config());

        for _ in 0..100 {
            gate.push_frame(frame());
        }
        assert_eq!(gate.push_frame(frame()), GateState::Recording);
        assert_eq!(gate.into_session().len(), 26);
    }

    #[test]
    fn silence_timeout_crosses_at_threshold_plus_one() {
        // One speech frame, then 51 non-speech frames: the 51st crosses the
        // 50-frame (1000ms) threshold and finishes the session
        let mut script = vec![true];
        script.extend(vec![false; 51]);
        let mut gate = VoiceActivityGate::new(Scripted::new(script), config());

        gate.push_frame(frame());
        for _ in 0..50 {
            assert_eq!(gate.push_frame(frame()), GateState::Recording);
        }
        assert_eq!(gate.push_frame(frame()), GateState::Finished);
        // trailing silence is retained, not trimmed
        assert_eq!(gate.into_session().len(), 52);
    }

    #[test]
    fn speech_resumption_resets_the_silence_counter() {
        // speech, 49 silence, speech again, then full silence run
        let mut script = vec![true];
        script.extend(vec![false; 49]);
        script.push(true);
        script.extend(vec![false; 51]);
        let mut gate = VoiceActivityGate::new(Scripted::new(script), config());

        for _ in 0..51 {
            assert_eq!(gate.push_frame(frame()), GateState::Recording);
        }
        for _ in 0..50 {
            assert_eq!(gate.push_frame(frame()), GateState::Recording);
        }
        assert_eq!(gate.push_frame(frame()), GateState::Finished);
    }

    #[test]
    fn max_duration_caps_the_session() {
        let cfg = GateConfig {
            max_frames: 100,
            ..config()
        };
        let mut gate = VoiceActivityGate::new(Scripted::new(vec![true; 200]), cfg);
        let mut state = GateState::WaitingForSpeech;
        for _ in 0..100 {
            state = gate.push_frame(frame());
        }
        assert_eq!(state, GateState::Finished);
        assert_eq!(gate.into_session().len(), 100);
    }

    #[test]
    fn finished_gate_ignores_further_frames() {
        let cfg = GateConfig {
            max_frames: 10,
            ..config()
        };
        let mut gate = VoiceActivityGate::new(Scripted::new(vec![true; 50]), cfg);
        for _ in 0..15 {
            gate.push_frame(frame());
        }
        assert_eq!(gate.state(), GateState::Finished);
        assert_eq!(gate.into_session().len(), 10);
    }

    #[tokio::test]
    async fn stop_while_waiting_yields_empty_session() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let stop = StopSignal::new();
        stop.set();

        let gate = VoiceActivityGate::new(Scripted::new(vec![]), config());
        let session = gate.capture(&mut rx, &stop, |_| {}).await;
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn stop_during_short_recording_is_discardable() {
        // 10 speech frames queued, then stop: the partial session exists but
        // fails the minimum-length check, identical to a too-short timeout
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..10 {
            tx.send(frame()).unwrap();
        }

        let stop = StopSignal::new();
        let gate = VoiceActivityGate::new(Scripted::new(vec![true; 10]), config());

        let stop_clone = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop_clone.set();
        });

        let session = gate.capture(&mut rx, &stop, |_| {}).await;
        assert_eq!(session.len(), 10);
        assert!(!session.is_long_enough());
    }

    #[tokio::test]
    async fn amplitude_callback_sees_every_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut script = vec![true];
        script.extend(vec![false; 51]);
        for _ in 0..52 {
            tx.send(frame()).unwrap();
        }
        drop(tx);

        let stop = StopSignal::new();
        let gate = VoiceActivityGate::new(Scripted::new(script), config());

        let mut count = 0usize;
        let session = gate.capture(&mut rx, &stop, |_| count += 1).await;
        assert_eq!(count, 52);
        assert_eq!(session.len(), 52);
    }
}
