//! Streaming pipeline coordinator - links the four modalities with bounded queues.
//!
//! ```text
//! Pipeline A (whole session)
//!   AudioInput ──lossy──▶ detection stage ──▶ detector
//!                              │  speech start / end
//!                              ├──▶ segment feed ──▶ transcription task ──▶ controller
//!                              └──▶ controller
//!
//! Pipeline B + C (one agent response)
//!   generation stage ──chunks──▶ synthesis stage ──frames──▶ playback sink
//!        │ tool calls
//!        └──▶ ToolDispatcher ──▶ context
//! ```
//!
//! Audio capture is the only lossy boundary. Every response owns one
//! [`CancellationToken`]; cancelling it stops all of its stages.

use crate::config::SessionConfig;
use crate::context::SharedContext;
use crate::engines::{
    AudioFrame, Detector, DetectorEvent, GenerationRequest, GeneratorEvent, Generator,
    PlaybackSink, Synthesizer, TranscriptEvent, Transcriber,
};
use crate::error::{TurnError, TurnResult};
use crate::segment::SentenceSegmenter;
use crate::tools::{ToolDispatcher, ToolOutcome};
use crate::turn::{ControlEvent, TurnEvent};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lossy entry point for captured audio. Cheap to clone.
///
/// Frames pushed while the detection stage is behind are discarded and counted.
#[derive(Clone)]
pub struct AudioInput {
    tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl AudioInput {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<AudioFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let input = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (input, rx)
    }

    /// Offer a frame. Returns false if it was dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A span of audio classified as speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSegment {
    pub id: u64,
    pub start: Duration,
    pub end: Duration,
}

impl SpeechSegment {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Maps audio-stream offsets onto the session's monotonic clock.
///
/// The origin is fixed once: by the first captured frame, or, for a detector that
/// never sees audio, by its first event.
#[derive(Debug, Default)]
struct AudioClock {
    origin: Option<Instant>,
}

impl AudioClock {
    fn observe_frame(&mut self, frame: &AudioFrame) {
        if self.origin.is_none() {
            let now = Instant::now();
            self.origin = Some(now.checked_sub(frame.timestamp).unwrap_or(now));
        }
    }

    fn instant(&mut self, at: Duration) -> Instant {
        let origin = *self.origin.get_or_insert_with(|| {
            let now = Instant::now();
            now.checked_sub(at).unwrap_or(now)
        });
        origin + at
    }
}

/// Pipeline A front half: frames in, speech boundaries and per-segment audio out.
pub(crate) struct DetectionStage {
    pub(crate) config: SessionConfig,
    pub(crate) detector: Arc<dyn Detector>,
    pub(crate) transcriber: Arc<dyn Transcriber>,
    pub(crate) frames: mpsc::Receiver<AudioFrame>,
    pub(crate) control: mpsc::Sender<ControlEvent>,
    pub(crate) cancel: CancellationToken,
}

struct OpenSegment {
    id: u64,
    start: Duration,
    feed: mpsc::Sender<AudioFrame>,
    dropped: u64,
}

impl DetectionStage {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let DetectionStage {
            config,
            detector,
            transcriber,
            mut frames,
            control,
            cancel,
        } = self;

        let (detector_tx, detector_rx) = mpsc::channel(config.detector_queue_frames);
        let mut events = match detector.start(ReceiverStream::new(detector_rx).boxed()).await {
            Ok(events) => events,
            Err(e) => {
                error!("❌ Detector failed to start: {}", e);
                let _ = control.send(ControlEvent::DetectorFailed(e)).await;
                return;
            }
        };
        info!("👂 Detection stage running");

        let mut preroll: VecDeque<AudioFrame> = VecDeque::with_capacity(config.preroll_frames + 1);
        let mut clock = AudioClock::default();
        let mut open: Option<OpenSegment> = None;
        let mut next_segment = 0u64;
        let mut dropped = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(DetectorEvent::SpeechStart { at })) => {
                        if open.is_some() {
                            debug!("Speech start inside an open segment, ignored");
                            continue;
                        }
                        next_segment += 1;
                        let (feed, audio) = mpsc::channel(config.segment_queue_frames);
                        for frame in &preroll {
                            let _ = feed.try_send(frame.clone());
                        }
                        debug!("🗣️ Segment {} opened at {:?}", next_segment, at);
                        // The controller must know the segment before any transcript for it.
                        let started = ControlEvent::SpeechStarted { segment: next_segment, at: clock.instant(at) };
                        if control.send(started).await.is_err() {
                            break;
                        }
                        TranscriptionStage {
                            segment: next_segment,
                            transcriber: Arc::clone(&transcriber),
                            control: control.clone(),
                            cancel: cancel.child_token(),
                        }
                        .spawn(audio);
                        open = Some(OpenSegment { id: next_segment, start: at, feed, dropped: 0 });
                    }
                    Some(Ok(DetectorEvent::SpeechEnd { at })) => {
                        let Some(segment) = open.take() else { continue };
                        let span = SpeechSegment { id: segment.id, start: segment.start, end: at };
                        if segment.dropped > 0 {
                            warn!("Segment {} lost {} frames to a slow transcriber", span.id, segment.dropped);
                        }
                        debug!("🤫 Segment {} closed after {:?}", span.id, span.duration());
                        let sent = control
                            .send(ControlEvent::SpeechEnded { segment: span.id, at: clock.instant(at) })
                            .await;
                        // Dropping the feed ends the segment's audio stream.
                        drop(segment);
                        if sent.is_err() {
                            break;
                        }
                    }
                    Some(Ok(DetectorEvent::SpeechPaused { at })) => {
                        let Some(segment) = open.as_ref() else { continue };
                        let paused = ControlEvent::SpeechPaused { segment: segment.id, at: clock.instant(at) };
                        if control.send(paused).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(DetectorEvent::SpeechResumed { at })) => {
                        let Some(segment) = open.as_ref() else { continue };
                        let resumed = ControlEvent::SpeechResumed { segment: segment.id, at: clock.instant(at) };
                        if control.send(resumed).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("❌ Detector error: {}", e);
                        let _ = control.send(ControlEvent::DetectorFailed(e)).await;
                        break;
                    }
                    None => {
                        warn!("Detector stream ended");
                        break;
                    }
                },
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        debug!("Audio input closed");
                        break;
                    };
                    clock.observe_frame(&frame);
                    if let Err(TrySendError::Full(_)) = detector_tx.try_send(frame.clone()) {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            warn!("Detector is behind, {} frames dropped so far", dropped);
                        }
                    }
                    if let Some(segment) = open.as_mut() {
                        if segment.feed.try_send(frame.clone()).is_err() {
                            segment.dropped += 1;
                        }
                    }
                    if config.preroll_frames > 0 {
                        preroll.push_back(frame);
                        while preroll.len() > config.preroll_frames {
                            preroll.pop_front();
                        }
                    }
                }
            }
        }

        info!("🛑 Detection stage stopped");
    }
}

/// Pipeline A back half: one transcriber call per speech segment.
struct TranscriptionStage {
    segment: u64,
    transcriber: Arc<dyn Transcriber>,
    control: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
}

impl TranscriptionStage {
    fn spawn(self, audio: mpsc::Receiver<AudioFrame>) -> JoinHandle<()> {
        tokio::spawn(self.run(audio))
    }

    async fn run(self, audio: mpsc::Receiver<AudioFrame>) {
        let segment = self.segment;
        let audio = ReceiverStream::new(audio).boxed();
        let mut events = match self.transcriber.transcribe(audio, self.cancel.clone()).await {
            Ok(events) => events,
            Err(error) => {
                self.send(ControlEvent::TranscriptFailed { segment, error }).await;
                return;
            }
        };

        let mut last_partial: Option<String> = None;
        let mut got_final = false;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = events.next() => event,
            };
            match event {
                Some(Ok(TranscriptEvent::Partial(text))) => {
                    last_partial = Some(text.clone());
                    self.send(ControlEvent::Transcript {
                        segment,
                        event: TranscriptEvent::Partial(text),
                    })
                    .await;
                }
                Some(Ok(TranscriptEvent::Final(text))) => {
                    got_final = true;
                    debug!("📝 Segment {} final: \"{}\"", segment, text);
                    self.send(ControlEvent::Transcript {
                        segment,
                        event: TranscriptEvent::Final(text),
                    })
                    .await;
                }
                Some(Err(error)) => {
                    self.send(ControlEvent::TranscriptFailed { segment, error }).await;
                    return;
                }
                None => break,
            }
        }

        // A transcriber that only streams partials still settles the segment.
        if !got_final {
            let text = last_partial.unwrap_or_default();
            self.send(ControlEvent::Transcript {
                segment,
                event: TranscriptEvent::Final(text),
            })
            .await;
        }
    }

    async fn send(&self, event: ControlEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.control.send(event) => {}
        }
    }
}

/// What an agent response speaks.
#[derive(Debug, Clone)]
pub(crate) enum ResponseSource {
    /// Ask the generator, continuing after tool calls.
    Generate,
    /// Speak fixed text (greetings, announcements).
    Scripted(String),
}

struct ActiveResponse {
    id: u64,
    cancel: CancellationToken,
    generation: JoinHandle<()>,
    synthesis: JoinHandle<()>,
}

/// Starts and cancels agent responses. Owned by the turn controller.
pub(crate) struct ResponseCoordinator {
    config: SessionConfig,
    context: SharedContext,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    playback: Arc<dyn PlaybackSink>,
    tools: Arc<ToolDispatcher>,
    control: mpsc::Sender<ControlEvent>,
    events: broadcast::Sender<TurnEvent>,
    session_cancel: CancellationToken,
    active: Option<ActiveResponse>,
}

impl ResponseCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SessionConfig,
        context: SharedContext,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        playback: Arc<dyn PlaybackSink>,
        tools: Arc<ToolDispatcher>,
        control: mpsc::Sender<ControlEvent>,
        events: broadcast::Sender<TurnEvent>,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            context,
            generator,
            synthesizer,
            playback,
            tools,
            control,
            events,
            session_cancel,
            active: None,
        }
    }

    /// Spawn generation and synthesis for response `id`. Any previous response is cancelled first.
    pub(crate) async fn start_response(&mut self, id: u64, source: ResponseSource) {
        self.cancel_active_response().await;

        let cancel = self.session_cancel.child_token();
        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.synthesis_queue);

        let generation = GenerationStage {
            response: id,
            config: self.config.clone(),
            context: Arc::clone(&self.context),
            generator: Arc::clone(&self.generator),
            tools: Arc::clone(&self.tools),
            chunks: chunk_tx,
            control: self.control.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };
        let synthesis = SynthesisStage {
            response: id,
            synthesizer: Arc::clone(&self.synthesizer),
            playback: Arc::clone(&self.playback),
            chunks: chunk_rx,
            control: self.control.clone(),
            cancel: cancel.clone(),
            timeout: self.config.synthesis_timeout(),
        };

        debug!("🚀 Response {} started", id);
        self.active = Some(ActiveResponse {
            id,
            cancel,
            generation: tokio::spawn(generation.run(source)),
            synthesis: tokio::spawn(synthesis.run()),
        });
    }

    /// Abort generation and synthesis, stop playback and wait for both stages to
    /// wind down. Returns false when there was nothing to cancel.
    pub(crate) async fn cancel_active_response(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        {
            // Generation commits under this lock only while the token is live,
            // so the agent message is either fully appended or not at all.
            let _ctx = self.context.write().await;
            active.cancel.cancel();
        }
        self.playback.stop();
        info!("✂️ Response {} cancelled", active.id);
        self.join(active).await;
        true
    }

    /// Forget a response whose stages have already finished.
    pub(crate) async fn release_response(&mut self) {
        if let Some(active) = self.active.take() {
            self.join(active).await;
        }
    }

    async fn join(&self, active: ActiveResponse) {
        let grace = self.config.cancel_grace();
        for (stage, mut handle) in [
            ("generation", active.generation),
            ("synthesis", active.synthesis),
        ] {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    "⏱️ {} stage of response {} overran {:?}, aborting",
                    stage, active.id, grace
                );
                handle.abort();
            }
        }
    }
}

/// Pipeline B: generator call(s), tool dispatch, sentence chunking.
struct GenerationStage {
    response: u64,
    config: SessionConfig,
    context: SharedContext,
    generator: Arc<dyn Generator>,
    tools: Arc<ToolDispatcher>,
    chunks: mpsc::Sender<String>,
    control: mpsc::Sender<ControlEvent>,
    events: broadcast::Sender<TurnEvent>,
    cancel: CancellationToken,
}

impl GenerationStage {
    async fn run(self, source: ResponseSource) {
        let mut segmenter = SentenceSegmenter::new(self.config.min_chunk_chars);
        let mut first_chunk = true;

        let result = match source {
            ResponseSource::Generate => self.generate(&mut segmenter, &mut first_chunk).await,
            ResponseSource::Scripted(text) => {
                let mut result = Ok(());
                for chunk in segmenter.push(&text) {
                    result = self.emit_chunk(chunk, &mut first_chunk).await;
                    if result.is_err() {
                        break;
                    }
                }
                result.map(|()| Some(text))
            }
        };

        let result = match result {
            Ok(Some(text)) => self.finish(&mut segmenter, &mut first_chunk, text).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(error) = result {
            if self.cancel.is_cancelled() {
                debug!("Response {} stopped during cancellation: {}", self.response, error);
                return;
            }
            warn!("⚠️ Generation for response {} failed: {}", self.response, error);
            self.send_control(ControlEvent::ResponseFailed {
                response: self.response,
                error,
            })
            .await;
        }
        // Dropping `chunks` lets synthesis drain and finish.
    }

    /// Returns the spoken text, or None if the response was cancelled.
    async fn generate(
        &self,
        segmenter: &mut SentenceSegmenter,
        first_chunk: &mut bool,
    ) -> TurnResult<Option<String>> {
        let definitions = self.tools.definitions();
        let mut spoken = String::new();

        for round in 0..=self.config.max_tool_rounds {
            let messages = self.context.read().await.messages().to_vec();
            let request = GenerationRequest {
                messages,
                tools: definitions.clone(),
                cancel: self.cancel.clone(),
            };
            let mut stream = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                stream = self.generator.generate(request) => stream?,
            };

            let mut tool_calls = 0usize;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(None),
                    next = tokio::time::timeout(self.config.generation_timeout(), stream.next()) => next,
                };
                let event = match next {
                    Err(_) => {
                        return Err(TurnError::GenerationFailure(format!(
                            "no output from generator for {:?}",
                            self.config.generation_timeout()
                        )))
                    }
                    Ok(None) => break,
                    Ok(Some(event)) => event?,
                };

                match event {
                    GeneratorEvent::TextDelta(delta) => {
                        spoken.push_str(&delta);
                        for chunk in segmenter.push(&delta) {
                            self.emit_chunk(chunk, first_chunk).await?;
                        }
                    }
                    GeneratorEvent::ToolCall(invocation) => {
                        tool_calls += 1;
                        match self
                            .tools
                            .dispatch_into(&invocation, &self.context, &self.cancel)
                            .await?
                        {
                            ToolOutcome::Cancelled => return Ok(None),
                            ToolOutcome::Completed { is_error, .. } => {
                                let _ = self.events.send(TurnEvent::ToolInvoked {
                                    name: invocation.name.clone(),
                                    is_error,
                                });
                            }
                        }
                    }
                }
            }

            if tool_calls == 0 {
                return Ok(Some(spoken));
            }
            if round == self.config.max_tool_rounds {
                break;
            }
            debug!("🔁 Continuing response {} after {} tool call(s)", self.response, tool_calls);
        }

        Err(TurnError::GenerationFailure(format!(
            "tool call limit of {} rounds reached",
            self.config.max_tool_rounds
        )))
    }

    /// Flush the tail to synthesis and append the agent message if still live.
    async fn finish(
        &self,
        segmenter: &mut SentenceSegmenter,
        first_chunk: &mut bool,
        text: String,
    ) -> TurnResult<()> {
        if let Some(rest) = segmenter.flush() {
            self.emit_chunk(rest, first_chunk).await?;
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }

        let mut ctx = self.context.write().await;
        if self.cancel.is_cancelled() {
            debug!("Response {} cancelled before commit, discarded", self.response);
            return Ok(());
        }
        ctx.append_agent(text.clone())?;
        drop(ctx);

        info!("💬 Agent response committed ({} chars)", text.len());
        let _ = self.events.send(TurnEvent::AgentResponseCommitted { text });
        Ok(())
    }

    async fn emit_chunk(&self, chunk: String, first_chunk: &mut bool) -> TurnResult<()> {
        if *first_chunk {
            *first_chunk = false;
            self.send_control(ControlEvent::FirstSegmentReady {
                response: self.response,
            })
            .await;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            sent = self.chunks.send(chunk) => sent.map_err(|_| {
                TurnError::SynthesisFailure("synthesis stage stopped".to_string())
            }),
        }
    }

    async fn send_control(&self, event: ControlEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.control.send(event) => {}
        }
    }
}

/// Pipeline C: chunk → synthesizer → playback.
struct SynthesisStage {
    response: u64,
    synthesizer: Arc<dyn Synthesizer>,
    playback: Arc<dyn PlaybackSink>,
    chunks: mpsc::Receiver<String>,
    control: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl SynthesisStage {
    async fn run(mut self) {
        let result = self.play_all().await;

        if self.cancel.is_cancelled() {
            self.playback.stop();
            return;
        }
        let event = match result {
            Ok(()) => {
                debug!("🔊 Response {} fully played", self.response);
                ControlEvent::PlaybackFinished {
                    response: self.response,
                }
            }
            Err(error) => {
                // Nothing more of this response may be heard.
                self.playback.stop();
                warn!("⚠️ Synthesis for response {} failed: {}", self.response, error);
                ControlEvent::ResponseFailed {
                    response: self.response,
                    error,
                }
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.control.send(event) => {}
        }
    }

    async fn play_all(&mut self) -> TurnResult<()> {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                chunk = self.chunks.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };

            debug!("🎙️ Synthesizing \"{}\"", chunk);
            let mut frames = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frames = self.synthesizer.synthesize(&chunk, self.cancel.clone()) => frames?,
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    next = tokio::time::timeout(self.timeout, frames.next()) => next,
                };
                let frame = match next {
                    Err(_) => {
                        return Err(TurnError::SynthesisFailure(format!(
                            "no audio from synthesizer for {:?}",
                            self.timeout
                        )))
                    }
                    Ok(None) => break,
                    Ok(Some(frame)) => frame?,
                };
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    played = self.playback.play(frame) => played?,
                }
            }
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            drained = self.playback.drain() => drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audio_input_drops_when_full() {
        let (input, mut rx) = AudioInput::channel(2);
        let frame = AudioFrame::silence(16000, Duration::from_millis(20), Duration::ZERO);
        assert!(input.push(frame.clone()));
        assert!(input.push(frame.clone()));
        assert!(!input.push(frame.clone()));
        assert_eq!(input.dropped_frames(), 1);

        rx.recv().await.unwrap();
        assert!(input.push(frame.clone()));
        drop(rx);
        assert!(input.is_closed());
        assert!(!input.push(frame));
        assert_eq!(input.dropped_frames(), 1);
    }

    #[test]
    fn segment_duration() {
        let span = SpeechSegment {
            id: 1,
            start: Duration::from_millis(200),
            end: Duration::from_millis(900),
        };
        assert_eq!(span.duration(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn audio_clock_keeps_detector_offsets() {
        let mut clock = AudioClock::default();
        let origin = Instant::now();
        clock.observe_frame(&AudioFrame::silence(16000, Duration::from_millis(20), Duration::ZERO));
        tokio::time::advance(Duration::from_millis(900)).await;

        // A boundary confirmed late still lands where the audio put it.
        assert_eq!(clock.instant(Duration::from_millis(300)), origin + Duration::from_millis(300));
        clock.observe_frame(&AudioFrame::silence(16000, Duration::from_millis(20), Duration::from_millis(900)));
        assert_eq!(clock.instant(Duration::from_millis(300)), origin + Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn audio_clock_anchors_on_first_event_without_frames() {
        let mut clock = AudioClock::default();
        tokio::time::advance(Duration::from_millis(500)).await;
        let now = Instant::now();
        assert_eq!(clock.instant(Duration::from_millis(400)), now);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(clock.instant(Duration::from_millis(500)), now + Duration::from_millis(100));
    }
}
