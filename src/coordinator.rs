//! One-turn orchestration: capture, transcribe, generate, speak
//!
//! A turn walks the Idle → Listening → Processing → Speaking → Idle cycle.
//! Capture and inference happen inline in the turn; speech goes out through
//! the synthesis pipeline, and the turn hands back a `drained` receiver that
//! resolves when the last queued sentence has finished playing. The Idle
//! transition is emitted from the pipeline's drain marker, so the UI only
//! returns to idle once the speaker is actually quiet.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::Result;
use crate::audio::AudioFrame;
use crate::llm::{ChunkSink, NO_PROVIDER, ResponseStreamer};
use crate::segment::SentenceSegmenter;
use crate::stop::StopSignal;
use crate::stt::TranscriptionService;
use crate::synth::{AmplitudeCallback, SynthesisJob, SynthesisPipeline};
use crate::vad::{GateConfig, SpeechDetector, VoiceActivityGate};

/// Pipeline position, published to the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Between turns
    Idle,
    /// Waiting for or recording an utterance
    Listening,
    /// Transcription and generation in flight
    Processing,
    /// Sentences queued or playing
    Speaking,
}

/// Events published to the frontend
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// State machine transition
    State(TurnState),
    /// Instantaneous audio level (mic while listening, speaker while speaking)
    Amplitude(f32),
    /// Final filtered transcript of the user's utterance
    Transcript(String),
    /// Full generated reply and the provider that produced it
    Response { text: String, provider: String },
}

/// Best-effort event publisher. A closed or absent receiver never fails a
/// turn; events are simply dropped.
#[derive(Clone)]
pub struct StatusSink(Option<mpsc::UnboundedSender<UiEvent>>);

impl StatusSink {
    /// Publish into the given channel
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self(Some(tx))
    }

    /// Discard all events
    #[must_use]
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Send one event, ignoring delivery failure
    pub fn emit(&self, event: UiEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Builds a fresh per-turn frame classifier. The WebRTC VAD keeps internal
/// state across frames, so each turn gets its own instance.
pub type DetectorFactory = Box<dyn Fn() -> Result<Box<dyn SpeechDetector>> + Send + Sync>;

/// Streams closed sentence units into the synthesis queue as deltas arrive
struct SentenceSink<'a> {
    segmenter: SentenceSegmenter,
    synth: &'a SynthesisPipeline,
    amplitude: AmplitudeCallback,
}

impl SentenceSink<'_> {
    fn speak(&self, text: String) {
        self.synth
            .submit(SynthesisJob::speak(text).with_amplitude(Arc::clone(&self.amplitude)));
    }
}

impl ChunkSink for SentenceSink<'_> {
    fn attempt_started(&mut self) {
        // a failed provider's unterminated tail must not prefix the next
        // provider's first sentence
        self.segmenter = SentenceSegmenter::new();
    }

    fn delta(&mut self, chunk: &str) {
        for unit in self.segmenter.push(chunk) {
            tracing::debug!(sentence = %unit, "queueing sentence");
            self.speak(unit);
        }
    }
}

/// What one turn produced
pub enum TurnOutcome {
    /// No usable utterance: silence, noise, a filtered transcript, or a stop
    /// request before anything was committed
    NoSpeech,
    /// A full exchange. `drained` resolves once the reply has finished
    /// playing.
    Completed {
        transcript: String,
        response: String,
        provider: String,
        drained: oneshot::Receiver<()>,
    },
}

/// Drives one turn at a time over shared long-lived services
pub struct TurnCoordinator {
    stt: Arc<TranscriptionService>,
    llm: ResponseStreamer,
    synth: SynthesisPipeline,
    detector_factory: DetectorFactory,
    gate_config: GateConfig,
    events: StatusSink,
}

impl TurnCoordinator {
    /// Assemble a coordinator over the given services
    #[must_use]
    pub fn new(
        stt: Arc<TranscriptionService>,
        llm: ResponseStreamer,
        synth: SynthesisPipeline,
        detector_factory: DetectorFactory,
        gate_config: GateConfig,
        events: StatusSink,
    ) -> Self {
        Self {
            stt,
            llm,
            synth,
            detector_factory,
            gate_config,
            events,
        }
    }

    /// Run one full turn against the live frame stream.
    ///
    /// The stop signal is honored at every stage boundary: a stop during
    /// capture or inference abandons the turn with [`TurnOutcome::NoSpeech`]
    /// and nothing is spoken.
    ///
    /// # Errors
    ///
    /// Returns error if the speech detector cannot be constructed
    pub async fn run_turn(
        &self,
        frames: &mut mpsc::UnboundedReceiver<AudioFrame>,
        stop: &StopSignal,
    ) -> Result<TurnOutcome> {
        self.events.emit(UiEvent::State(TurnState::Listening));

        let detector = (self.detector_factory)()?;
        let gate = VoiceActivityGate::new(detector, self.gate_config);
        let mic_events = self.events.clone();
        let session = gate
            .capture(frames, stop, |level| {
                mic_events.emit(UiEvent::Amplitude(level));
            })
            .await;

        if stop.is_set() || !session.is_long_enough() {
            tracing::debug!(
                duration_ms = session.duration_ms(),
                "no usable utterance, returning to idle"
            );
            self.events.emit(UiEvent::State(TurnState::Idle));
            return Ok(TurnOutcome::NoSpeech);
        }

        self.events.emit(UiEvent::State(TurnState::Processing));
        tracing::info!(duration_ms = session.duration_ms(), "utterance captured");

        let transcript = self.stt.transcribe(&session).await;
        if transcript.is_empty() || stop.is_set() {
            self.events.emit(UiEvent::State(TurnState::Idle));
            return Ok(TurnOutcome::NoSpeech);
        }
        self.events.emit(UiEvent::Transcript(transcript.clone()));

        self.events.emit(UiEvent::State(TurnState::Speaking));

        let speaker_events = self.events.clone();
        let amplitude: AmplitudeCallback = Arc::new(move |level| {
            speaker_events.emit(UiEvent::Amplitude(level));
        });

        // sentences are queued for synthesis the moment the segmenter closes
        // them, while later deltas are still streaming in
        let mut sink = SentenceSink {
            segmenter: SentenceSegmenter::new(),
            synth: &self.synth,
            amplitude: Arc::clone(&amplitude),
        };
        let (response, provider) = self.llm.generate(&transcript, Some(&mut sink)).await;

        if provider == NO_PROVIDER {
            // nothing streamed; speak the apology whole
            self.synth.submit(
                SynthesisJob::speak(response.clone()).with_amplitude(Arc::clone(&amplitude)),
            );
        } else if let Some(tail) = sink.segmenter.flush() {
            sink.speak(tail);
        }

        self.events.emit(UiEvent::Response {
            text: response.clone(),
            provider: provider.clone(),
        });

        let (drained_tx, drained_rx) = oneshot::channel();
        let idle_events = self.events.clone();
        self.synth.submit(SynthesisJob::drain_marker(move || {
            idle_events.emit(UiEvent::State(TurnState::Idle));
            let _ = drained_tx.send(());
        }));

        Ok(TurnOutcome::Completed {
            transcript,
            response,
            provider,
            drained: drained_rx,
        })
    }

    /// Tear down the synthesis pipeline, letting queued speech finish
    pub async fn shutdown(self) {
        self.synth.shutdown().await;
    }
}
