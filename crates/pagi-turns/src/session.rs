//! **Voice session** - the public handle tying engines, pipelines and the turn controller together.
//!
//! A session owns one conversation. Audio goes in through [`AudioInput`]; the
//! controller decides when the user has finished, runs the generator (with tools)
//! and speaks the answer, and stops speaking when the user barges in.

use crate::config::SessionConfig;
use crate::context::{ContextSnapshot, ConversationContext, SharedContext};
use crate::engines::Engines;
use crate::error::{TurnError, TurnResult};
use crate::pipeline::{AudioInput, DetectionStage, ResponseCoordinator};
use crate::tools::ToolDispatcher;
use crate::turn::{ControlEvent, TurnController, TurnEvent, TurnState};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

const EVENT_CAPACITY: usize = 256;

/// Handle to a running voice session. Dropping it shuts the session down.
pub struct VoiceSession {
    control: mpsc::Sender<ControlEvent>,
    input: AudioInput,
    state: watch::Receiver<TurnState>,
    events: broadcast::Sender<TurnEvent>,
    context: SharedContext,
    cancel: CancellationToken,
}

/// Start a session. Shorthand for [`VoiceSession::start`].
pub async fn start_session(
    engines: Engines,
    config: SessionConfig,
    system_prompt: impl Into<String>,
    tools: ToolDispatcher,
) -> TurnResult<VoiceSession> {
    VoiceSession::start(engines, config, system_prompt, tools).await
}

impl VoiceSession {
    /// Validate the configuration, seed the context with `system_prompt` and spawn
    /// the detection stage and the turn controller. Must run inside a tokio runtime.
    pub async fn start(
        engines: Engines,
        config: SessionConfig,
        system_prompt: impl Into<String>,
        tools: ToolDispatcher,
    ) -> TurnResult<Self> {
        config.validate()?;
        info!("🎭 Starting voice session ({} tools)", tools.tool_names().len());

        let context = ConversationContext::with_system_prompt(system_prompt)?.into_shared();
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(config.control_queue);
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (input, frames) = AudioInput::channel(config.audio_queue_frames);

        DetectionStage {
            config: config.clone(),
            detector: Arc::clone(&engines.detector),
            transcriber: Arc::clone(&engines.transcriber),
            frames,
            control: control_tx.clone(),
            cancel: cancel.child_token(),
        }
        .spawn();

        let coordinator = ResponseCoordinator::new(
            config.clone(),
            Arc::clone(&context),
            engines.generator,
            engines.synthesizer,
            engines.playback,
            Arc::new(tools),
            control_tx.clone(),
            events.clone(),
            cancel.clone(),
        );
        let controller = TurnController::new(
            config,
            Arc::clone(&context),
            coordinator,
            engines.shutdown,
            cancel.clone(),
            state_tx,
            events.clone(),
        );
        tokio::spawn(controller.run(control_rx));

        info!("✅ Voice session started");
        Ok(Self {
            control: control_tx,
            input,
            state: state_rx,
            events,
            context,
            cancel,
        })
    }

    /// Lossy sender for captured audio frames.
    pub fn audio_input(&self) -> AudioInput {
        self.input.clone()
    }

    /// Speak `text` as an agent turn without a preceding user turn (greetings).
    ///
    /// Only accepted while Idle; otherwise fails with `SessionBusy`.
    pub async fn say(&self, text: impl Into<String>, allow_interruptions: bool) -> TurnResult<()> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlEvent::Say {
                text: text.into(),
                allow_interruptions,
                reply,
            })
            .await
            .map_err(|_| TurnError::SessionClosed)?;
        response.await.map_err(|_| TurnError::SessionClosed)?
    }

    /// Cancel any response, move to ShuttingDown and return the final conversation.
    ///
    /// Fails with `ContextInvariantViolation` if the log is inconsistent; the shutdown
    /// collaborator is not called in that case.
    pub async fn stop(&self) -> TurnResult<ContextSnapshot> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlEvent::Stop { reply })
            .await
            .map_err(|_| TurnError::SessionClosed)?;
        let result = response.await.map_err(|_| TurnError::SessionClosed)?;
        self.cancel.cancel();
        result
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<TurnState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    /// Copy of the conversation so far.
    pub async fn snapshot(&self) -> ContextSnapshot {
        self.context.read().await.snapshot()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.input.dropped_frames()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
