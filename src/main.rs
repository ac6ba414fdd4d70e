use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voxloop::audio::{
    AudioFrame, AudioPlayback, AudioSink, FRAME_MS, FrameSource, PLAYBACK_SAMPLE_RATE,
};
use voxloop::config::Config;
use voxloop::coordinator::{
    DetectorFactory, StatusSink, TurnCoordinator, TurnOutcome, UiEvent,
};
use voxloop::llm::ResponseStreamer;
use voxloop::stop::StopSignal;
use voxloop::stt::TranscriptionService;
use voxloop::synth::{SynthesisPipeline, SynthesisService};
use voxloop::vad::{GateConfig, WebRtcDetector};

/// Delay after the assistant finishes speaking before the mic reopens, so
/// the speaker tail is not transcribed back
const ECHO_GUARD: Duration = Duration::from_millis(500);

/// Delay before retrying after a turn with no usable speech
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Voxloop - hands-free voice conversation loop
#[derive(Parser)]
#[command(name = "voxloop", version, about)]
struct Cli {
    /// Config file path (defaults to the platform config directory)
    #[arg(short, long, env = "VOXLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voxloop=info",
        1 => "info,voxloop=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&config, &text).await,
        };
    }

    tracing::info!("starting voxloop");

    let stt = Arc::new(TranscriptionService::new(config.stt.clone()));
    let llm = ResponseStreamer::new(&config.llm, &config.persona);
    let tts = Arc::new(SynthesisService::new(config.tts.clone()));
    let sink: Box<dyn AudioSink> = Box::new(AudioPlayback::new()?);
    let synth = SynthesisPipeline::start(tts, sink)?;

    // Fail on a bad aggressiveness at startup rather than mid-turn
    let aggressiveness = config.gate.vad_aggressiveness;
    drop(WebRtcDetector::new(aggressiveness)?);
    let detector_factory: DetectorFactory =
        Box::new(move || Ok(Box::new(WebRtcDetector::new(aggressiveness)?)));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(log_events(events_rx));

    let coordinator = TurnCoordinator::new(
        stt,
        llm,
        synth,
        detector_factory,
        GateConfig::from(&config.gate),
        StatusSink::new(events_tx),
    );

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let mut source = FrameSource::open()?;
    source.start(frames_tx)?;

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping");
                stop.set();
            }
        });
    }

    tracing::info!("ready - start speaking");

    while !stop.is_set() {
        match coordinator.run_turn(&mut frames_rx, &stop).await? {
            TurnOutcome::NoSpeech => {
                tokio::time::sleep(RETRY_DELAY).await;
                discard_pending(&mut frames_rx);
            }
            TurnOutcome::Completed { drained, .. } => {
                let _ = drained.await;
                // frames captured while the assistant was speaking are echo
                discard_pending(&mut frames_rx);
                tokio::time::sleep(ECHO_GUARD).await;
                discard_pending(&mut frames_rx);
            }
        }
    }

    source.stop();
    coordinator.shutdown().await;
    tracing::info!("goodbye");
    Ok(())
}

/// Log UI events; a frontend would render these instead
async fn log_events(mut events: mpsc::UnboundedReceiver<UiEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::State(state) => tracing::debug!(?state, "turn state"),
            UiEvent::Transcript(text) => tracing::info!(%text, "heard"),
            UiEvent::Response { text, provider } => {
                tracing::info!(%provider, %text, "replying");
            }
            UiEvent::Amplitude(_) => {}
        }
    }
}

/// Throw away any frames queued while the pipeline was busy
fn discard_pending(frames: &mut mpsc::UnboundedReceiver<AudioFrame>) {
    while frames.try_recv().is_ok() {}
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let mut source = FrameSource::open()?;
    source.start(frames_tx)?;

    let frames_per_second = (1000 / FRAME_MS) as usize;
    println!("---");

    for i in 0..duration {
        let mut peak = 0.0f32;
        let mut energy_sum = 0.0f32;

        for _ in 0..frames_per_second {
            let Some(frame) = frames_rx.recv().await else {
                anyhow::bail!("audio capture stopped unexpectedly");
            };
            peak = peak.max(frame.amplitude);
            energy_sum += frame.amplitude;
        }

        #[allow(clippy::cast_precision_loss)]
        let energy = energy_sum / frames_per_second as f32;

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    source.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let duration_secs = 2.0_f32;
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let num_samples = (PLAYBACK_SAMPLE_RATE as f32 * duration_secs) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {num_samples} samples at {PLAYBACK_SAMPLE_RATE} Hz...");
    play_blocking(samples).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Synthesizing: \"{text}\"");

    let service = SynthesisService::new(config.tts.clone());
    let chunks = service.synthesize(text).await?;

    for samples in chunks {
        println!("Playing {} samples...", samples.len());
        play_blocking(samples).await?;
    }

    println!("Done!");
    Ok(())
}

/// Run blocking playback off the async runtime
async fn play_blocking(samples: Vec<f32>) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> voxloop::Result<()> {
        let mut playback = AudioPlayback::new()?;
        playback.play(&samples)
    })
    .await??;
    Ok(())
}
