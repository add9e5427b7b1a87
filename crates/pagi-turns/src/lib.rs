//! # PAGI Turns - Real-Time Voice Turn-Taking
//!
//! Orchestrates a spoken conversation between a user and a language-model agent:
//! detects when the user starts and stops speaking, transcribes, generates a reply
//! (calling tools when the model asks for them), speaks it sentence by sentence and
//! stops talking the moment the user barges in.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          Voice Session                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │   Audio In   │→ │   Detector   │→ │   Turn Controller    │     │
//! │  │ (AudioInput) │  │ (VAD + STT)  │  │ (state, endpointing, │     │
//! │  └──────────────┘  └──────────────┘  │  interruption policy)│     │
//! │                                      └──────────────────────┘     │
//! │                                           ↓          ↑ cancel     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │  Audio Out   │← │ Synthesizer  │← │ Generator + Tools    │     │
//! │  │  (playback)  │  │  (per chunk) │  │ (sentence chunks)    │     │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Engines are injected through [`Engines`]; [`engines::placeholder`] has scripted
//! versions for tests, [`openai`] talks to OpenAI-compatible HTTP APIs and the
//! `audio` feature adds microphone capture, speaker playback and WebRTC VAD.

#[cfg(feature = "audio")]
pub mod audio;
pub mod config;
pub mod context;
pub mod engines;
pub mod error;
pub mod openai;
pub mod pipeline;
pub mod policy;
pub mod segment;
pub mod session;
pub mod tools;
pub mod turn;
pub mod vad;

#[cfg(feature = "audio")]
pub use audio::{AudioConfig, MicrophoneCapture, RodioPlayback};
pub use config::{InterruptionThresholds, SessionConfig};
pub use context::{ContextSnapshot, ConversationContext, ConversationMessage, Role, ToolCallMeta};
pub use engines::{
    AudioFrame, Detector, DetectorEvent, EngineStream, Engines, FrameStream, GenerationRequest,
    Generator, GeneratorEvent, PlaybackSink, ShutdownHandler, Synthesizer, TranscriptEvent,
    Transcriber,
};
pub use error::{BoxError, TurnError, TurnResult};
pub use openai::{ApiConfig, OpenAiGenerator, OpenAiSynthesizer, OpenAiTranscriber};
pub use pipeline::{AudioInput, SpeechSegment};
pub use policy::{InterruptionDecision, InterruptionPolicy};
pub use segment::SentenceSegmenter;
pub use session::{start_session, VoiceSession};
pub use tools::{tool_fn, ParamType, ToolDefinition, ToolDispatcher, ToolHandler, ToolInvocation, ToolOutcome};
pub use turn::{TurnEvent, TurnState};
pub use vad::{EnergyDetector, SpeechGate, VadConfig};
#[cfg(feature = "audio")]
pub use vad::WebRtcDetector;
