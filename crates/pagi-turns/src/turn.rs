//! Turn-taking management for conversational flow
//!
//! The [`TurnController`] is the single owner of [`TurnState`]. It consumes
//! detector, transcript and response events one at a time, runs the endpointing
//! and barge-in timers, and tells the response coordinator when to start or
//! cancel agent speech.

use crate::config::SessionConfig;
use crate::context::{ContextSnapshot, SharedContext};
use crate::engines::{ShutdownHandler, TranscriptEvent};
use crate::error::{TurnError, TurnResult};
use crate::pipeline::{ResponseCoordinator, ResponseSource};
use crate::policy::{count_words, InterruptionDecision, InterruptionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Who holds the floor. Exactly one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnState {
    Idle,
    UserSpeaking,
    Generating,
    AgentSpeaking,
    Interrupted,
    ShuttingDown,
}

impl TurnState {
    /// Whether `self -> to` is an edge of the turn state machine.
    pub fn can_transition_to(self, to: TurnState) -> bool {
        use TurnState::*;
        if to == ShuttingDown {
            return self != ShuttingDown;
        }
        matches!(
            (self, to),
            (Idle, UserSpeaking)
                | (Idle, AgentSpeaking)
                | (UserSpeaking, Generating)
                | (UserSpeaking, Idle)
                | (Generating, AgentSpeaking)
                | (Generating, Idle)
                | (AgentSpeaking, Idle)
                | (AgentSpeaking, Interrupted)
                | (Interrupted, UserSpeaking)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TurnState::ShuttingDown
    }
}

/// Events published to session subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged { from: TurnState, to: TurnState },

    /// Endpointing completed; this text was appended as the user message.
    UserTurnCommitted { text: String },

    /// Generation finished; this text was appended as the agent message.
    AgentResponseCommitted { text: String },

    /// User barged in on agent playback
    Interrupted { speech: Duration, words: usize },

    /// User speech during playback that did not meet the thresholds
    InterruptionIgnored { speech: Duration },

    ToolInvoked { name: String, is_error: bool },

    /// A collaborator failed; the session keeps running.
    Error(TurnError),

    Shutdown,
}

/// Inputs to the controller. Produced by the pipelines and the session handle.
pub(crate) enum ControlEvent {
    /// Boundary times come from the detector's audio offsets, not from delivery.
    SpeechStarted {
        segment: u64,
        at: Instant,
    },
    SpeechEnded {
        segment: u64,
        at: Instant,
    },
    SpeechPaused {
        segment: u64,
        at: Instant,
    },
    SpeechResumed {
        segment: u64,
        at: Instant,
    },
    Transcript {
        segment: u64,
        event: TranscriptEvent,
    },
    TranscriptFailed {
        segment: u64,
        error: TurnError,
    },
    DetectorFailed(TurnError),
    FirstSegmentReady {
        response: u64,
    },
    PlaybackFinished {
        response: u64,
    },
    ResponseFailed {
        response: u64,
        error: TurnError,
    },
    Say {
        text: String,
        allow_interruptions: bool,
        reply: oneshot::Sender<TurnResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<TurnResult<ContextSnapshot>>,
    },
}

/// What the controller knows about one detector speech segment.
#[derive(Debug)]
struct SpeechRecord {
    started: Instant,
    ended: Option<Instant>,
    /// Last voiced instant while the detector reports a pause.
    paused: Option<Instant>,
    partial: String,
    final_text: Option<String>,
    failed: bool,
}

impl SpeechRecord {
    fn new(started: Instant) -> Self {
        Self {
            started,
            ended: None,
            paused: None,
            partial: String::new(),
            final_text: None,
            failed: false,
        }
    }

    fn is_open(&self) -> bool {
        self.ended.is_none()
    }

    fn is_settled(&self) -> bool {
        self.final_text.is_some() || self.failed
    }

    /// Final text if present, otherwise the latest partial.
    fn text(&self) -> &str {
        self.final_text.as_deref().unwrap_or(&self.partial)
    }

    /// Voiced span so far. A paused segment stops growing until speech resumes.
    fn duration(&self, now: Instant) -> Duration {
        self.ended
            .or(self.paused)
            .unwrap_or(now)
            .saturating_duration_since(self.started)
    }
}

#[derive(Debug, Clone, Copy)]
struct ResponseInfo {
    id: u64,
    allow_interruptions: bool,
}

/// The per-session state machine.
pub(crate) struct TurnController {
    state: TurnState,
    policy: InterruptionPolicy,
    config: SessionConfig,
    context: SharedContext,
    coordinator: ResponseCoordinator,
    shutdown: Option<Arc<dyn ShutdownHandler>>,
    session_cancel: CancellationToken,
    state_tx: watch::Sender<TurnState>,
    events: broadcast::Sender<TurnEvent>,

    speech: HashMap<u64, SpeechRecord>,
    /// Segments making up the pending user turn, in order.
    user_turn: Vec<u64>,
    endpoint_deadline: Option<Instant>,
    /// Endpointing expired but some segment still lacks its final transcript.
    endpoint_expired: bool,
    transcript_deadline: Option<Instant>,
    /// Segment being evaluated as a possible barge-in.
    candidate: Option<u64>,
    interrupt_deadline: Option<Instant>,

    response: Option<ResponseInfo>,
    next_response: u64,
}

impl TurnController {
    pub(crate) fn new(
        config: SessionConfig,
        context: SharedContext,
        coordinator: ResponseCoordinator,
        shutdown: Option<Arc<dyn ShutdownHandler>>,
        session_cancel: CancellationToken,
        state_tx: watch::Sender<TurnState>,
        events: broadcast::Sender<TurnEvent>,
    ) -> Self {
        Self {
            state: TurnState::Idle,
            policy: InterruptionPolicy::new(config.thresholds),
            config,
            context,
            coordinator,
            shutdown,
            session_cancel,
            state_tx,
            events,
            speech: HashMap::new(),
            user_turn: Vec::new(),
            endpoint_deadline: None,
            endpoint_expired: false,
            transcript_deadline: None,
            candidate: None,
            interrupt_deadline: None,
            response: None,
            next_response: 0,
        }
    }

    /// Event loop. Returns after `Stop` or when the session is dropped.
    pub(crate) async fn run(mut self, mut control: mpsc::Receiver<ControlEvent>) {
        info!("🎭 Turn controller started");
        let session_cancel = self.session_cancel.clone();

        loop {
            let endpoint = self.endpoint_deadline;
            let transcript = self.transcript_deadline;
            let interrupt = self.interrupt_deadline;

            tokio::select! {
                biased;
                _ = session_cancel.cancelled() => {
                    if let Err(e) = self.shut_down().await {
                        warn!("Session dropped with an invalid context: {}", e);
                    }
                    break;
                }
                event = control.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle(event).await {
                        break;
                    }
                }
                _ = deadline(endpoint) => self.on_endpoint_expired().await,
                _ = deadline(transcript) => self.on_transcript_timeout().await,
                _ = deadline(interrupt) => self.on_interrupt_deadline().await,
            }
        }

        info!("🛑 Turn controller stopped");
    }

    /// Returns false once the controller should exit.
    async fn handle(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::SpeechStarted { segment, at } => self.on_speech_started(segment, at),
            ControlEvent::SpeechEnded { segment, at } => self.on_speech_ended(segment, at).await,
            ControlEvent::SpeechPaused { segment, at } => {
                if let Some(record) = self.speech.get_mut(&segment) {
                    record.paused = Some(at.max(record.started));
                }
            }
            ControlEvent::SpeechResumed { segment, .. } => self.on_speech_resumed(segment),
            ControlEvent::Transcript { segment, event } => self.on_transcript(segment, event).await,
            ControlEvent::TranscriptFailed { segment, error } => {
                warn!("⚠️ Transcription of segment {} failed: {}", segment, error);
                self.emit(TurnEvent::Error(error));
                if let Some(record) = self.speech.get_mut(&segment) {
                    record.failed = true;
                }
                self.after_transcript_update(segment).await;
            }
            ControlEvent::DetectorFailed(error) => {
                error!("❌ Detector failed: {}", error);
                self.emit(TurnEvent::Error(error));
            }
            ControlEvent::FirstSegmentReady { response } => self.on_first_segment(response),
            ControlEvent::PlaybackFinished { response } => self.on_playback_finished(response).await,
            ControlEvent::ResponseFailed { response, error } => {
                self.on_response_failed(response, error).await
            }
            ControlEvent::Say {
                text,
                allow_interruptions,
                reply,
            } => {
                let result = self.on_say(text, allow_interruptions).await;
                let _ = reply.send(result);
            }
            ControlEvent::Stop { reply } => {
                let result = self.shut_down().await;
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }

    fn on_speech_started(&mut self, segment: u64, at: Instant) {
        self.speech.insert(segment, SpeechRecord::new(at));

        match self.state {
            TurnState::Idle => self.begin_user_turn(segment),
            TurnState::UserSpeaking => {
                debug!("🎤 Speech resumed, endpointing reset");
                self.user_turn.push(segment);
                self.reset_endpointing();
            }
            TurnState::AgentSpeaking => {
                if self.interruptions_allowed() {
                    self.start_candidate(segment, at);
                } else {
                    debug!("🔇 User speech during a non-interruptible response");
                }
            }
            TurnState::Generating => debug!("🎤 Speech while generating, held until playback starts"),
            TurnState::Interrupted | TurnState::ShuttingDown => {}
        }
    }

    async fn on_speech_ended(&mut self, segment: u64, at: Instant) {
        let (ended, speech) = match self.speech.get_mut(&segment) {
            Some(record) => {
                let ended = at.max(record.started);
                record.ended = Some(ended);
                (ended, record.duration(ended))
            }
            None => return,
        };

        if self.state == TurnState::UserSpeaking
            && self.user_turn.contains(&segment)
            && !self.user_is_speaking()
        {
            let delay = self.config.thresholds.min_endpointing_delay();
            debug!("🤫 Speech ended, endpointing {:?} after it", delay);
            self.endpoint_deadline = Some(ended + delay);
        }

        if self.candidate == Some(segment) {
            self.interrupt_deadline = None;
            if speech < self.config.thresholds.min_speech_duration_to_interrupt() {
                self.ignore_candidate(speech);
            } else {
                self.evaluate_candidate().await;
            }
        }

        self.prune();
    }

    /// Speech came back inside a paused segment; the barge-in clock runs again.
    fn on_speech_resumed(&mut self, segment: u64) {
        let Some(record) = self.speech.get_mut(&segment) else { return };
        record.paused = None;
        let started = record.started;
        if self.candidate == Some(segment) && self.interrupt_deadline.is_none() {
            self.start_candidate(segment, started);
        }
    }

    async fn on_transcript(&mut self, segment: u64, event: TranscriptEvent) {
        let Some(record) = self.speech.get_mut(&segment) else {
            debug!("Transcript for released segment {} dropped", segment);
            return;
        };
        match event {
            TranscriptEvent::Partial(text) => record.partial = text,
            TranscriptEvent::Final(text) => {
                record.final_text = Some(match record.final_text.take() {
                    Some(previous) => format!("{} {}", previous, text),
                    None => text,
                });
            }
        }
        self.after_transcript_update(segment).await;
    }

    async fn after_transcript_update(&mut self, segment: u64) {
        // Words never count before the duration threshold has passed.
        if self.candidate == Some(segment) && self.interrupt_deadline.is_none() {
            self.evaluate_candidate().await;
        }
        if self.state == TurnState::UserSpeaking
            && self.endpoint_expired
            && self.user_turn.contains(&segment)
            && self.user_turn_settled()
        {
            self.commit_user_turn().await;
        }
    }

    async fn on_endpoint_expired(&mut self) {
        self.endpoint_deadline = None;
        if self.state != TurnState::UserSpeaking {
            return;
        }
        if self.user_turn_settled() {
            self.commit_user_turn().await;
        } else {
            debug!("⏳ Endpointing expired, waiting for final transcript");
            self.endpoint_expired = true;
            self.transcript_deadline = Some(Instant::now() + self.config.transcript_timeout());
        }
    }

    async fn on_transcript_timeout(&mut self) {
        self.transcript_deadline = None;
        if self.state == TurnState::UserSpeaking && self.endpoint_expired {
            warn!("⏱️ Final transcript late, committing what was heard");
            self.commit_user_turn().await;
        }
    }

    async fn on_interrupt_deadline(&mut self) {
        self.interrupt_deadline = None;
        self.evaluate_candidate().await;
    }

    fn on_first_segment(&mut self, response: u64) {
        if !self.is_current(response) || self.state != TurnState::Generating {
            return;
        }
        self.transition(TurnState::AgentSpeaking);

        if self.interruptions_allowed() {
            if let Some((segment, started)) = self.open_segment() {
                debug!("🎤 User already speaking as playback starts");
                self.start_candidate(segment, started);
            }
        }
    }

    async fn on_playback_finished(&mut self, response: u64) {
        if !self.is_current(response) {
            return;
        }
        self.response = None;
        self.coordinator.release_response().await;

        if matches!(self.state, TurnState::AgentSpeaking | TurnState::Generating) {
            self.drop_candidate();
            self.transition(TurnState::Idle);
            self.resume_listening();
        }
    }

    async fn on_response_failed(&mut self, response: u64, error: TurnError) {
        if !self.is_current(response) {
            return;
        }
        warn!("⚠️ Response {} failed: {}", response, error);
        self.emit(TurnEvent::Error(error));
        self.response = None;
        self.coordinator.cancel_active_response().await;

        if matches!(self.state, TurnState::AgentSpeaking | TurnState::Generating) {
            self.drop_candidate();
            self.transition(TurnState::Idle);
            self.resume_listening();
        }
    }

    async fn on_say(&mut self, text: String, allow_interruptions: bool) -> TurnResult<()> {
        if self.state != TurnState::Idle {
            return Err(TurnError::SessionBusy(self.state));
        }
        info!("🗣️ Speaking injected text ({} chars)", text.len());
        self.transition(TurnState::AgentSpeaking);
        self.start_response(ResponseSource::Scripted(text), allow_interruptions)
            .await;
        Ok(())
    }

    async fn shut_down(&mut self) -> TurnResult<ContextSnapshot> {
        if self.state.is_terminal() {
            return Err(TurnError::SessionClosed);
        }
        info!("🛑 Shutting down voice session");

        self.response = None;
        self.coordinator.cancel_active_response().await;
        self.drop_candidate();
        self.user_turn.clear();
        self.reset_endpointing();
        self.transition(TurnState::ShuttingDown);
        self.session_cancel.cancel();

        let snapshot = {
            let ctx = self.context.read().await;
            if let Err(e) = ctx.validate() {
                error!("❌ Context invalid at shutdown: {}", e);
                self.emit(TurnEvent::Error(e.clone()));
                return Err(e);
            }
            ctx.snapshot()
        };

        if let Some(handler) = &self.shutdown {
            handler.on_shutdown(snapshot.clone()).await;
        }
        self.emit(TurnEvent::Shutdown);
        info!("✅ Session closed with {} messages", snapshot.len());
        Ok(snapshot)
    }

    async fn evaluate_candidate(&mut self) {
        let Some(segment) = self.candidate else { return };
        let Some(record) = self.speech.get(&segment) else {
            self.candidate = None;
            return;
        };
        let speech = record.duration(Instant::now());
        let words = count_words(record.text());
        let settled = !record.is_open() && record.is_settled();

        match self.policy.evaluate(self.state, speech, words) {
            InterruptionDecision::Interrupt => self.interrupt(segment, speech, words).await,
            InterruptionDecision::Ignore if settled => self.ignore_candidate(speech),
            InterruptionDecision::Ignore => {
                if self.policy.needs_words(words) {
                    debug!("Barge-in candidate has {} words, waiting for more", words);
                }
            }
        }
    }

    async fn interrupt(&mut self, segment: u64, speech: Duration, words: usize) {
        info!(
            "⚡ Barge-in after {:?} ({} words): silencing agent output",
            speech, words
        );
        self.transition(TurnState::Interrupted);
        self.emit(TurnEvent::Interrupted { speech, words });

        self.candidate = None;
        self.interrupt_deadline = None;
        self.response = None;
        self.coordinator.cancel_active_response().await;

        // The interrupting speech is the start of the new user turn.
        self.user_turn = vec![segment];
        self.reset_endpointing();
        self.transition(TurnState::UserSpeaking);

        if let Some(ended) = self.speech.get(&segment).and_then(|r| r.ended) {
            self.endpoint_deadline = Some(ended + self.config.thresholds.min_endpointing_delay());
        }
    }

    async fn commit_user_turn(&mut self) {
        self.reset_endpointing();
        let segments = std::mem::take(&mut self.user_turn);
        let text = segments
            .iter()
            .filter_map(|id| self.speech.get(id))
            .map(|r| r.text().trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        self.prune();

        if text.is_empty() {
            info!("🔇 Nothing transcribed, back to idle");
            self.transition(TurnState::Idle);
            return;
        }

        let appended = self.context.write().await.append_user(text.clone());
        if let Err(e) = appended {
            error!("❌ Could not record user turn: {}", e);
            self.emit(TurnEvent::Error(e));
            self.transition(TurnState::Idle);
            return;
        }

        info!("🎯 User turn committed: \"{}\"", text);
        self.emit(TurnEvent::UserTurnCommitted { text });
        self.transition(TurnState::Generating);
        self.start_response(ResponseSource::Generate, true).await;
    }

    async fn start_response(&mut self, source: ResponseSource, allow_interruptions: bool) {
        self.next_response += 1;
        let id = self.next_response;
        self.response = Some(ResponseInfo {
            id,
            allow_interruptions,
        });
        self.coordinator.start_response(id, source).await;
    }

    fn begin_user_turn(&mut self, segment: u64) {
        self.user_turn = vec![segment];
        self.reset_endpointing();
        self.transition(TurnState::UserSpeaking);
    }

    /// After the agent stops, speech that is still going becomes the next user turn.
    fn resume_listening(&mut self) {
        if self.state != TurnState::Idle {
            return;
        }
        if let Some((segment, _)) = self.open_segment() {
            self.begin_user_turn(segment);
        }
    }

    fn start_candidate(&mut self, segment: u64, started: Instant) {
        let min = self.config.thresholds.min_speech_duration_to_interrupt();
        debug!("👂 Evaluating possible barge-in (segment {})", segment);
        self.candidate = Some(segment);
        self.interrupt_deadline = Some(started + min);
    }

    fn ignore_candidate(&mut self, speech: Duration) {
        debug!("🙉 Ignored {:?} of speech during playback", speech);
        self.emit(TurnEvent::InterruptionIgnored { speech });
        self.drop_candidate();
    }

    fn drop_candidate(&mut self) {
        self.candidate = None;
        self.interrupt_deadline = None;
        self.prune();
    }

    fn reset_endpointing(&mut self) {
        self.endpoint_deadline = None;
        self.endpoint_expired = false;
        self.transcript_deadline = None;
    }

    fn interruptions_allowed(&self) -> bool {
        self.response.map(|r| r.allow_interruptions).unwrap_or(true)
    }

    fn is_current(&self, response: u64) -> bool {
        self.response.map(|r| r.id) == Some(response)
    }

    fn user_is_speaking(&self) -> bool {
        self.user_turn
            .iter()
            .any(|id| self.speech.get(id).map(SpeechRecord::is_open).unwrap_or(false))
    }

    fn user_turn_settled(&self) -> bool {
        self.user_turn
            .iter()
            .all(|id| self.speech.get(id).map(SpeechRecord::is_settled).unwrap_or(true))
    }

    fn open_segment(&self) -> Option<(u64, Instant)> {
        self.speech
            .iter()
            .find(|(_, r)| r.is_open())
            .map(|(id, r)| (*id, r.started))
    }

    /// Forget segments nothing refers to any more.
    fn prune(&mut self) {
        let user_turn = &self.user_turn;
        let candidate = self.candidate;
        self.speech
            .retain(|id, r| r.is_open() || user_turn.contains(id) || candidate == Some(*id));
    }

    fn transition(&mut self, to: TurnState) {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!("❌ Refusing illegal transition {:?} -> {:?}", from, to);
            self.emit(TurnEvent::Error(TurnError::InvalidTransition { from, to }));
            return;
        }
        info!("🔀 {:?} -> {:?}", from, to);
        self.state = to;
        self.state_tx.send_replace(to);
        self.emit(TurnEvent::StateChanged { from, to });
    }

    fn emit(&self, event: TurnEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Sleep until `at`, or forever when no timer is armed.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TurnState::*;

    const ALL: [TurnState; 6] = [
        Idle,
        UserSpeaking,
        Generating,
        AgentSpeaking,
        Interrupted,
        ShuttingDown,
    ];

    #[test]
    fn documented_edges_only() {
        let allowed = [
            (Idle, UserSpeaking),
            (Idle, AgentSpeaking),
            (UserSpeaking, Generating),
            (UserSpeaking, Idle),
            (Generating, AgentSpeaking),
            (Generating, Idle),
            (AgentSpeaking, Idle),
            (AgentSpeaking, Interrupted),
            (Interrupted, UserSpeaking),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to)) || (to == ShuttingDown && from != ShuttingDown);
                assert_eq!(from.can_transition_to(to), expected, "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn interrupted_cannot_skip_to_generation() {
        assert!(!Interrupted.can_transition_to(Generating));
        assert!(!AgentSpeaking.can_transition_to(UserSpeaking));
        assert!(!UserSpeaking.can_transition_to(AgentSpeaking));
        assert!(ShuttingDown.is_terminal());
    }

    #[test]
    fn record_prefers_final_text() {
        let mut record = SpeechRecord::new(Instant::now());
        record.partial = "cerco casa".into();
        assert_eq!(record.text(), "cerco casa");
        assert!(!record.is_settled());
        record.final_text = Some("cerco casa in centro".into());
        assert_eq!(record.text(), "cerco casa in centro");
        assert!(record.is_settled());
    }

    #[test]
    fn paused_record_stops_growing() {
        let start = Instant::now();
        let mut record = SpeechRecord::new(start);
        record.paused = Some(start + Duration::from_millis(100));
        assert_eq!(record.duration(start + Duration::from_secs(1)), Duration::from_millis(100));

        record.paused = None;
        assert_eq!(record.duration(start + Duration::from_secs(1)), Duration::from_secs(1));

        record.ended = Some(start + Duration::from_millis(700));
        assert_eq!(record.duration(start + Duration::from_secs(5)), Duration::from_millis(700));
    }
}
