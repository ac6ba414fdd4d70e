//! Two-stage speech synthesis pipeline
//!
//! Stage one (a tokio task) synthesizes queued text jobs into audio chunks.
//! Stage two (a dedicated OS thread) plays chunks to completion one at a
//! time. The stages are joined by a channel, so synthesis of sentence N+1
//! overlaps playback of sentence N while playback order stays exactly the
//! submission order.
//!
//! The playback stage lives on its own thread because cpal streams are not
//! `Send` and blocking playback must not stall the async runtime.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use tokio::sync::{Mutex, mpsc};

use crate::audio::{AudioSink, rms_f32};
use crate::config::TtsConfig;
use crate::tts::{OpenAiTts, TtsEngine};
use crate::{Error, Result};

/// Shared callback reporting output loudness for UI animation
pub type AmplitudeCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Callback invoked on the playback thread once a job has fully drained
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// One unit of work for the pipeline.
///
/// A job with empty text synthesizes nothing and acts purely as an ordering
/// marker: its completion fires only after every previously submitted job has
/// finished playing.
pub struct SynthesisJob {
    text: String,
    amplitude: Option<AmplitudeCallback>,
    completion: Option<CompletionCallback>,
}

impl SynthesisJob {
    /// A job that speaks `text`
    #[must_use]
    pub fn speak(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            amplitude: None,
            completion: None,
        }
    }

    /// A no-audio marker whose completion fires after the queue has drained
    #[must_use]
    pub fn drain_marker(completion: impl FnOnce() + Send + 'static) -> Self {
        Self {
            text: String::new(),
            amplitude: None,
            completion: Some(Box::new(completion)),
        }
    }

    /// Attach an output-amplitude callback
    #[must_use]
    pub fn with_amplitude(mut self, callback: AmplitudeCallback) -> Self {
        self.amplitude = Some(callback);
        self
    }
}

/// Owns the TTS engine lifecycle. The engine is constructed at most once
/// under a lock, on first use.
pub struct SynthesisService {
    config: TtsConfig,
    engine: Mutex<Option<Arc<dyn TtsEngine>>>,
}

impl SynthesisService {
    /// Create a service that will lazily construct an [`OpenAiTts`] engine
    #[must_use]
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
        }
    }

    /// Create a service over a pre-built engine (tests, alternative backends)
    #[must_use]
    pub fn with_engine(engine: Arc<dyn TtsEngine>) -> Self {
        Self {
            config: TtsConfig::default(),
            engine: Mutex::new(Some(engine)),
        }
    }

    /// Get the engine, constructing it on first call
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be constructed
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn TtsEngine>> {
        let mut guard = self.engine.lock().await;
        if let Some(engine) = guard.as_ref() {
            return Ok(Arc::clone(engine));
        }

        tracing::info!(base_url = %self.config.base_url, model = %self.config.model, "loading TTS engine");
        let engine: Arc<dyn TtsEngine> = Arc::new(OpenAiTts::new(&self.config)?);
        *guard = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Synthesize `text` in the configured voice
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be loaded or synthesis fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<Vec<f32>>> {
        let engine = self.ensure_loaded().await?;
        engine.synthesize(text, &self.config.voice).await
    }
}

/// What the synthesis stage hands to the playback thread
enum PlaybackEntry {
    /// One chunk of samples ready to play
    Audio {
        samples: Vec<f32>,
        amplitude: Option<AmplitudeCallback>,
    },
    /// End of one job. Carries the job's completion, if any.
    Sentinel { completion: Option<CompletionCallback> },
}

/// Running pipeline handle. Dropping the handle without [`shutdown`] leaks
/// the playback thread until its channel drains.
///
/// [`shutdown`]: SynthesisPipeline::shutdown
pub struct SynthesisPipeline {
    jobs: mpsc::UnboundedSender<SynthesisJob>,
    synthesis: tokio::task::JoinHandle<()>,
    playback: std::thread::JoinHandle<()>,
}

impl SynthesisPipeline {
    /// Spawn both stages over the given service and output sink
    ///
    /// # Errors
    ///
    /// Returns error if the playback thread cannot be spawned
    pub fn start(service: Arc<SynthesisService>, mut sink: Box<dyn AudioSink>) -> Result<Self> {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<SynthesisJob>();
        let (play_tx, play_rx) = std_mpsc::channel::<PlaybackEntry>();

        let synthesis = tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                if !job.text.trim().is_empty() {
                    match service.synthesize(&job.text).await {
                        Ok(chunks) => {
                            for samples in chunks {
                                let entry = PlaybackEntry::Audio {
                                    samples,
                                    amplitude: job.amplitude.clone(),
                                };
                                if play_tx.send(entry).is_err() {
                                    tracing::warn!("playback stage gone, dropping audio");
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, text = %job.text, "synthesis failed, skipping job");
                        }
                    }
                }

                // the sentinel goes through even when synthesis failed, so
                // waiters behind this job are never stranded
                let sentinel = PlaybackEntry::Sentinel {
                    completion: job.completion,
                };
                if play_tx.send(sentinel).is_err() {
                    return;
                }
            }
            tracing::debug!("synthesis stage finished");
        });

        let playback = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                while let Ok(entry) = play_rx.recv() {
                    match entry {
                        PlaybackEntry::Audio { samples, amplitude } => {
                            if let Some(cb) = &amplitude {
                                cb(rms_f32(&samples));
                            }
                            if let Err(e) = sink.play(&samples) {
                                tracing::error!(error = %e, "playback failed, continuing");
                            }
                            if let Some(cb) = &amplitude {
                                cb(0.0);
                            }
                        }
                        PlaybackEntry::Sentinel { completion } => {
                            if let Some(done) = completion {
                                done();
                            }
                        }
                    }
                }
                tracing::debug!("playback stage finished");
            })
            .map_err(Error::Io)?;

        Ok(Self {
            jobs: jobs_tx,
            synthesis,
            playback,
        })
    }

    /// Queue a job. Jobs play in submission order.
    pub fn submit(&self, job: SynthesisJob) {
        if self.jobs.send(job).is_err() {
            tracing::warn!("synthesis pipeline closed, dropping job");
        }
    }

    /// Close the queue, let in-flight jobs finish, and join both stages
    pub async fn shutdown(self) {
        drop(self.jobs);
        if self.synthesis.await.is_err() {
            tracing::error!("synthesis stage panicked");
        }

        let playback = self.playback;
        let _ = tokio::task::spawn_blocking(move || {
            if playback.join().is_err() {
                tracing::error!("playback stage panicked");
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Engine that encodes the request text length into its output and takes
    /// longer for earlier (shorter) inputs
    struct ScriptedEngine;

    #[async_trait]
    impl TtsEngine for ScriptedEngine {
        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<Vec<f32>>> {
            // invert latency with length so out-of-order playback would show
            let delay = 30u64.saturating_sub(text.len() as u64 * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(vec![vec![text.len() as f32]])
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl TtsEngine for FailingEngine {
        async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<Vec<f32>>> {
            Err(Error::Tts("backend offline".to_string()))
        }
    }

    /// Sink recording the first sample of every chunk it plays
    struct RecordingSink {
        played: Arc<StdMutex<Vec<f32>>>,
    }

    impl AudioSink for RecordingSink {
        fn play(&mut self, samples: &[f32]) -> Result<()> {
            if let Some(&first) = samples.first() {
                self.played.lock().unwrap().push(first);
            }
            Ok(())
        }
    }

    struct FailingSink {
        attempts: Arc<StdMutex<u32>>,
    }

    impl AudioSink for FailingSink {
        fn play(&mut self, _samples: &[f32]) -> Result<()> {
            *self.attempts.lock().unwrap() += 1;
            Err(Error::Audio("device lost".to_string()))
        }
    }

    fn pipeline_with(
        engine: Arc<dyn TtsEngine>,
        sink: Box<dyn AudioSink>,
    ) -> SynthesisPipeline {
        let service = Arc::new(SynthesisService::with_engine(engine));
        SynthesisPipeline::start(service, sink).unwrap()
    }

    #[tokio::test]
    async fn jobs_play_in_submission_order() {
        let played = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(RecordingSink {
            played: Arc::clone(&played),
        });
        let pipeline = pipeline_with(Arc::new(ScriptedEngine), sink);

        // shorter text synthesizes slower, so order is only preserved if the
        // pipeline serializes jobs
        pipeline.submit(SynthesisJob::speak("a"));
        pipeline.submit(SynthesisJob::speak("bbb"));
        pipeline.submit(SynthesisJob::speak("ccccc"));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pipeline.submit(SynthesisJob::drain_marker(move || {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert_eq!(*played.lock().unwrap(), vec![1.0, 3.0, 5.0]);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn drain_marker_alone_completes_without_audio() {
        let played = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(RecordingSink {
            played: Arc::clone(&played),
        });
        let pipeline = pipeline_with(Arc::new(ScriptedEngine), sink);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pipeline.submit(SynthesisJob::drain_marker(move || {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert!(played.lock().unwrap().is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn synthesis_failure_does_not_strand_waiters() {
        let played = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(RecordingSink {
            played: Arc::clone(&played),
        });
        let pipeline = pipeline_with(Arc::new(FailingEngine), sink);

        pipeline.submit(SynthesisJob::speak("this will fail"));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pipeline.submit(SynthesisJob::drain_marker(move || {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert!(played.lock().unwrap().is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn playback_failure_continues_to_later_jobs() {
        let attempts = Arc::new(StdMutex::new(0u32));
        let sink = Box::new(FailingSink {
            attempts: Arc::clone(&attempts),
        });
        let pipeline = pipeline_with(Arc::new(ScriptedEngine), sink);

        pipeline.submit(SynthesisJob::speak("one"));
        pipeline.submit(SynthesisJob::speak("two"));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pipeline.submit(SynthesisJob::drain_marker(move || {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert_eq!(*attempts.lock().unwrap(), 2);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn amplitude_callback_brackets_each_chunk() {
        let played = Arc::new(StdMutex::new(Vec::new()));
        let sink = Box::new(RecordingSink {
            played: Arc::clone(&played),
        });
        let pipeline = pipeline_with(Arc::new(ScriptedEngine), sink);

        let levels = Arc::new(StdMutex::new(Vec::new()));
        let levels_cb = Arc::clone(&levels);
        let callback: AmplitudeCallback =
            Arc::new(move |level| levels_cb.lock().unwrap().push(level));

        pipeline.submit(SynthesisJob::speak("hi").with_amplitude(callback));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pipeline.submit(SynthesisJob::drain_marker(move || {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        let levels = levels.lock().unwrap();
        assert_eq!(levels.len(), 2);
        assert!(levels[0] > 0.0);
        assert_eq!(levels[1], 0.0);
        pipeline.shutdown().await;
    }
}
