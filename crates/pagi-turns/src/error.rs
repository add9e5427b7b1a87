//! Error types for the turn-taking orchestrator

use crate::turn::TurnState;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type TurnResult<T> = Result<T, TurnError>;

/// Boxed error returned by tool handlers and engine adapters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while orchestrating a voice session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TurnError {
    #[error("Tool already registered: {0}")]
    DuplicateToolName(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool '{tool}' failed: {cause}")]
    HandlerFailure { tool: String, cause: String },

    #[error("Generation error: {0}")]
    GenerationFailure(String),

    #[error("Synthesis error: {0}")]
    SynthesisFailure(String),

    #[error("Transcription error: {0}")]
    TranscriptionFailure(String),

    #[error("Detection error: {0}")]
    DetectionFailure(String),

    #[error("Context invariant violated: {0}")]
    ContextInvariantViolation(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Illegal turn transition {from:?} -> {to:?}")]
    InvalidTransition { from: TurnState, to: TurnState },

    #[error("Session is busy ({0:?})")]
    SessionBusy(TurnState),

    #[error("Session closed")]
    SessionClosed,
}

impl TurnError {
    /// Errors produced while resolving or running a tool. These are reported
    /// back to the model as a failed tool result instead of ending the turn.
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            TurnError::UnknownTool(_)
                | TurnError::InvalidArguments { .. }
                | TurnError::HandlerFailure { .. }
        )
    }

    /// Collaborator failures the controller recovers from by dropping the
    /// current response and returning to Idle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TurnError::GenerationFailure(_)
                | TurnError::SynthesisFailure(_)
                | TurnError::TranscriptionFailure(_)
                | TurnError::Playback(_)
        ) || self.is_tool_error()
    }
}

impl From<config::ConfigError> for TurnError {
    fn from(err: config::ConfigError) -> Self {
        TurnError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for TurnError {
    fn from(err: toml::de::Error) -> Self {
        TurnError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for TurnError {
    fn from(err: reqwest::Error) -> Self {
        TurnError::GenerationFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_errors_are_recoverable() {
        let err = TurnError::UnknownTool("search_property".into());
        assert!(err.is_tool_error());
        assert!(err.is_recoverable());
        assert!(!TurnError::ContextInvariantViolation("x".into()).is_recoverable());
    }

    #[test]
    fn display_includes_tool_name() {
        let err = TurnError::InvalidArguments {
            tool: "search_property".into(),
            reason: "missing 'zona'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid arguments for tool 'search_property': missing 'zona'"
        );
    }
}
