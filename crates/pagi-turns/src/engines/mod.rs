//! Collaborator interfaces: one capability trait per modality.
//!
//! Concrete engines (VAD, STT, LLM, TTS, playback) are injected at session
//! construction through [`Engines`]; the orchestrator never depends on a specific
//! backend. Every streaming call is cancellable, either through the token it
//! receives or by dropping the returned stream.

pub mod placeholder;

use crate::context::{ContextSnapshot, ConversationMessage};
use crate::error::TurnResult;
use crate::tools::{ToolDefinition, ToolInvocation};
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fallible stream produced by an engine.
pub type EngineStream<T> = BoxStream<'static, TurnResult<T>>;

/// Stream of audio frames fed into an engine.
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// A block of mono PCM samples (f32, -1.0..1.0).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Capture (or synthesis) offset from the start of the stream.
    pub timestamp: Duration,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp,
        }
    }

    /// A frame of silence lasting `duration`.
    pub fn silence(sample_rate: u32, duration: Duration, timestamp: Duration) -> Self {
        let len = (sample_rate as f64 * duration.as_secs_f64()).round() as usize;
        Self::new(vec![0.0; len], sample_rate, timestamp)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Root-mean-square level of the frame.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }
}

/// Speech boundaries reported by a detector, stamped with the audio offset of the
/// boundary itself rather than the moment it was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEvent {
    SpeechStart { at: Duration },
    SpeechEnd { at: Duration },
    /// Silence inside an open segment that may still turn out to be its end.
    /// Optional; lets barge-in count voiced time only while the end is unconfirmed.
    SpeechPaused { at: Duration },
    /// Speech came back before the pause closed the segment.
    SpeechResumed { at: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Revisable hypothesis for the segment so far.
    Partial(String),
    /// Final text for the segment.
    Final(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorEvent {
    TextDelta(String),
    ToolCall(ToolInvocation),
}

/// One call to the language model.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolDefinition>,
    pub cancel: CancellationToken,
}

/// Voice-activity detection over a continuous frame stream.
#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    async fn start(&self, frames: FrameStream) -> TurnResult<EngineStream<DetectorEvent>>;
}

/// Streaming speech-to-text for one speech segment. The audio stream ends when the segment does.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: FrameStream,
        cancel: CancellationToken,
    ) -> TurnResult<EngineStream<TranscriptEvent>>;
}

/// Streaming language-model call. Re-invoked with appended tool results to continue a response.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> TurnResult<EngineStream<GeneratorEvent>>;
}

/// Text-to-speech for one response chunk.
#[async_trait::async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> TurnResult<EngineStream<AudioFrame>>;
}

/// Speaker output. Only one response writes to it at a time.
#[async_trait::async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Queue a frame; may wait to keep the device queue short.
    async fn play(&self, frame: AudioFrame) -> TurnResult<()>;

    /// Wait until queued audio has been heard.
    async fn drain(&self) -> TurnResult<()> {
        Ok(())
    }

    /// Stop immediately and discard queued audio. Idempotent.
    fn stop(&self);
}

/// Receives the final conversation when the session shuts down.
#[async_trait::async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn on_shutdown(&self, snapshot: ContextSnapshot);
}

/// The engines a session runs with.
#[derive(Clone)]
pub struct Engines {
    pub detector: Arc<dyn Detector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub playback: Arc<dyn PlaybackSink>,
    pub shutdown: Option<Arc<dyn ShutdownHandler>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_and_level() {
        let frame = AudioFrame::silence(16000, Duration::from_millis(30), Duration::ZERO);
        assert_eq!(frame.samples.len(), 480);
        assert_eq!(frame.duration(), Duration::from_millis(30));
        assert_eq!(frame.rms(), 0.0);

        let loud = AudioFrame::new(vec![0.5; 480], 16000, Duration::ZERO);
        assert!((loud.rms() - 0.5).abs() < 1e-6);
    }
}
