//! Scripted engines for tests and for running the voice loop without real backends.
//!
//! Each placeholder plays back a script instead of listening or thinking, and
//! records what the session asked of it so tests can assert on the traffic.

use super::{
    AudioFrame, Detector, DetectorEvent, EngineStream, FrameStream, GenerationRequest,
    GeneratorEvent, Generator, PlaybackSink, ShutdownHandler, Synthesizer, TranscriptEvent,
    Transcriber,
};
use crate::context::ContextSnapshot;
use crate::error::{TurnError, TurnResult};
use crate::tools::ToolInvocation;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Sample rate of every placeholder frame.
pub const PLACEHOLDER_SAMPLE_RATE: u32 = 16_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Detector driven by hand through a [`DetectorHandle`]. Audio frames are consumed and ignored.
pub struct ScriptedDetector {
    events: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
}

/// Injects speech boundaries into a [`ScriptedDetector`].
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<DetectorEvent>,
    origin: Instant,
}

impl ScriptedDetector {
    pub fn new() -> (Self, DetectorHandle) {
        let (tx, rx) = mpsc::channel(32);
        let detector = Self {
            events: Mutex::new(Some(rx)),
        };
        let handle = DetectorHandle {
            tx,
            origin: Instant::now(),
        };
        (detector, handle)
    }
}

impl DetectorHandle {
    pub async fn speech_start(&self) {
        let at = self.origin.elapsed();
        let _ = self.tx.send(DetectorEvent::SpeechStart { at }).await;
    }

    pub async fn speech_end(&self) {
        let at = self.origin.elapsed();
        let _ = self.tx.send(DetectorEvent::SpeechEnd { at }).await;
    }
}

#[async_trait::async_trait]
impl Detector for ScriptedDetector {
    async fn start(&self, frames: FrameStream) -> TurnResult<EngineStream<DetectorEvent>> {
        let events = lock(&self.events)
            .take()
            .ok_or_else(|| TurnError::DetectionFailure("scripted detector already started".to_string()))?;
        tokio::spawn(frames.for_each(|_| async {}));
        Ok(ReceiverStream::new(events).map(Ok).boxed())
    }
}

/// What the transcriber says about one speech segment.
#[derive(Debug, Clone, Default)]
pub struct TranscriptScript {
    /// Emitted as soon as the segment opens.
    pub partials: Vec<String>,
    /// Emitted once the segment's audio ends.
    pub final_text: Option<String>,
    pub fail: bool,
}

impl TranscriptScript {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            final_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_partial(mut self, text: impl Into<String>) -> Self {
        self.partials.push(text.into());
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

/// Transcriber that answers each segment with the next script, in order.
///
/// Once the scripts run out every segment transcribes to empty text.
pub struct ScriptedTranscriber {
    scripts: Mutex<VecDeque<TranscriptScript>>,
    calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(scripts: impl IntoIterator<Item = TranscriptScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of segments transcribed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        mut audio: FrameStream,
        cancel: CancellationToken,
    ) -> TurnResult<EngineStream<TranscriptEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| TranscriptScript::final_text(""));

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for partial in script.partials {
                if tx.send(Ok(TranscriptEvent::Partial(partial))).await.is_err() {
                    return;
                }
            }
            // Wait for the segment to close.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = audio.next() => if frame.is_none() { break },
                }
            }
            if script.fail {
                let _ = tx
                    .send(Err(TurnError::TranscriptionFailure("scripted failure".to_string())))
                    .await;
            } else if let Some(text) = script.final_text {
                let _ = tx.send(Ok(TranscriptEvent::Final(text))).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// One scripted generator reply.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub events: Vec<GeneratorEvent>,
    /// Wait before each event.
    pub delay: Duration,
    /// Fail after the events with this message.
    pub failure: Option<String>,
}

impl ScriptedResponse {
    /// Reply streaming `text` word by word.
    pub fn text(text: &str) -> Self {
        Self::default().then_text(text)
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::default().then_tool_call(name, arguments)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn then_text(mut self, text: &str) -> Self {
        self.events.extend(
            text.split_inclusive(' ')
                .map(|word| GeneratorEvent::TextDelta(word.to_string())),
        );
        self
    }

    pub fn then_tool_call(mut self, name: &str, arguments: serde_json::Value) -> Self {
        self.events
            .push(GeneratorEvent::ToolCall(ToolInvocation::new(name, arguments)));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Generator replaying scripted responses, one per call. Exhausted scripts yield an empty reply.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait::async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> TurnResult<EngineStream<GeneratorEvent>> {
        lock(&self.requests).push(request);
        let response = lock(&self.responses).pop_front().unwrap_or_default();

        let delay = response.delay;
        let events = stream::iter(response.events).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, TurnError>(event)
        });
        let failure = stream::iter(
            response
                .failure
                .map(|message| Err(TurnError::GenerationFailure(message))),
        );
        Ok(events.chain(failure).boxed())
    }
}

/// Synthesizer producing silent frames and recording the text it was given.
pub struct RecordingSynthesizer {
    frames_per_chunk: usize,
    frame_duration: Duration,
    fail: bool,
    chunks: Mutex<Vec<String>>,
}

impl RecordingSynthesizer {
    pub fn new(frames_per_chunk: usize, frame_duration: Duration) -> Self {
        Self {
            frames_per_chunk,
            frame_duration,
            fail: false,
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Synthesizer whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0, Duration::ZERO)
        }
    }

    /// Text chunks received so far.
    pub fn chunks(&self) -> Vec<String> {
        lock(&self.chunks).clone()
    }
}

#[async_trait::async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str, _cancel: CancellationToken) -> TurnResult<EngineStream<AudioFrame>> {
        lock(&self.chunks).push(text.to_string());
        if self.fail {
            return Err(TurnError::SynthesisFailure("scripted failure".to_string()));
        }
        let frame_duration = self.frame_duration;
        let frames = (0..self.frames_per_chunk).map(move |i| {
            Ok(AudioFrame::silence(
                PLACEHOLDER_SAMPLE_RATE,
                frame_duration,
                frame_duration * i as u32,
            ))
        });
        Ok(stream::iter(frames).boxed())
    }
}

/// Playback sink that plays in simulated real time and counts what it played.
#[derive(Default)]
pub struct RecordingPlayback {
    played: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played_frames(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PlaybackSink for RecordingPlayback {
    async fn play(&self, frame: AudioFrame) -> TurnResult<()> {
        tokio::time::sleep(frame.duration()).await;
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shutdown collaborator that keeps the final snapshot.
#[derive(Default)]
pub struct CollectingShutdown {
    snapshot: Mutex<Option<ContextSnapshot>>,
}

impl CollectingShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<ContextSnapshot> {
        lock(&self.snapshot).clone()
    }
}

#[async_trait::async_trait]
impl ShutdownHandler for CollectingShutdown {
    async fn on_shutdown(&self, snapshot: ContextSnapshot) {
        *lock(&self.snapshot) = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generator_replays_scripts_in_order() {
        let generator = ScriptedGenerator::new([
            ScriptedResponse::text("Ciao a te"),
            ScriptedResponse::failing("boom"),
        ]);
        let request = || GenerationRequest {
            messages: Vec::new(),
            tools: Vec::new(),
            cancel: CancellationToken::new(),
        };

        let first: Vec<_> = generator.generate(request()).await.unwrap().collect().await;
        let text: String = first
            .into_iter()
            .map(|e| match e.unwrap() {
                GeneratorEvent::TextDelta(d) => d,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(text, "Ciao a te");

        let second: Vec<_> = generator.generate(request()).await.unwrap().collect().await;
        assert!(matches!(second.as_slice(), [Err(TurnError::GenerationFailure(_))]));

        let third: Vec<_> = generator.generate(request()).await.unwrap().collect().await;
        assert!(third.is_empty());
        assert_eq!(generator.requests().len(), 3);
    }

    #[tokio::test]
    async fn transcriber_waits_for_segment_end() {
        let transcriber = ScriptedTranscriber::new([TranscriptScript::final_text("buongiorno").with_partial("buon")]);
        let (tx, rx) = mpsc::channel(4);
        let mut events = transcriber
            .transcribe(ReceiverStream::new(rx).boxed(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(events.next().await.unwrap().unwrap(), TranscriptEvent::Partial("buon".into()));
        tx.send(AudioFrame::silence(PLACEHOLDER_SAMPLE_RATE, Duration::from_millis(20), Duration::ZERO))
            .await
            .unwrap();
        drop(tx);
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            TranscriptEvent::Final("buongiorno".into())
        );
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn playback_counts_frames() {
        let synth = RecordingSynthesizer::new(3, Duration::from_millis(100));
        let playback = RecordingPlayback::new();
        let mut frames = synth.synthesize("Ciao!", CancellationToken::new()).await.unwrap();
        while let Some(frame) = frames.next().await {
            playback.play(frame.unwrap()).await.unwrap();
        }
        assert_eq!(playback.played_frames(), 3);
        assert_eq!(synth.chunks(), vec!["Ciao!".to_string()]);
    }
}
