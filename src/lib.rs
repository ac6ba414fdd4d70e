//! Voxloop - hands-free voice conversation loop
//!
//! This library provides the full pipeline for a spoken back-and-forth with
//! an AI assistant:
//! - VAD-gated microphone capture (utterance detection with pre-roll)
//! - Speech-to-text with hallucination filtering
//! - Streaming text generation with provider failover
//! - Sentence-by-sentence speech synthesis and ordered playback
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Microphone                         │
//! │        cpal callback → 20ms frames (16kHz)           │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                  Turn Coordinator                     │
//! │   VAD Gate  │  STT  │  LLM Failover  │  Segmenter    │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ sentences
//! ┌────────────────────▼─────────────────────────────────┐
//! │              Synthesis Pipeline                       │
//! │   TTS (tokio task)  →  Playback (OS thread, 24kHz)   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod segment;
pub mod stop;
pub mod stt;
pub mod synth;
pub mod tts;
pub mod vad;

pub use config::Config;
pub use error::{Error, Result};
