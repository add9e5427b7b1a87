//! Session configuration: interruption thresholds, queue sizes and timeouts.
//!
//! Loaded from code defaults, an optional TOML file and `PAGI_TURNS_*` environment
//! variables. Durations are stored in milliseconds so every source can express them.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PAGI_TURNS_MIN_INTERRUPT_MS | 500 | Minimum user speech while the agent talks before barge-in. |
//! | PAGI_TURNS_MIN_INTERRUPT_WORDS | 0 | Words required in the transcript before barge-in (0 = acoustic only). |
//! | PAGI_TURNS_ENDPOINTING_MS | 500 | Quiet time after speech before the user turn is committed. |
//! | PAGI_TURNS_CANCEL_GRACE_MS | 500 | How long a cancelled stage may take to wind down before it is aborted. |
//! | PAGI_TURNS_GENERATION_TIMEOUT_MS | 15000 | Max wait for the next generator chunk. |
//! | PAGI_TURNS_SYNTHESIS_TIMEOUT_MS | 10000 | Max wait for the next synthesized frame. |
//! | PAGI_TURNS_TRANSCRIPT_TIMEOUT_MS | 3000 | Max wait for final transcripts once endpointing expires. |
//! | PAGI_TURNS_MAX_TOOL_ROUNDS | 5 | Continuation calls allowed per response. |

use crate::error::{TurnError, TurnResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Thresholds consumed by the interruption policy and the endpointing timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionThresholds {
    /// Candidate barge-in speech must last at least this long.
    #[serde(default = "default_min_interrupt_ms")]
    pub min_speech_duration_to_interrupt_ms: u64,
    /// When > 0, a transcript fragment with this many words is also required.
    #[serde(default)]
    pub min_words_to_interrupt: usize,
    /// Quiet period after speech end before the user turn is final.
    #[serde(default = "default_endpointing_ms")]
    pub min_endpointing_delay_ms: u64,
}

fn default_min_interrupt_ms() -> u64 {
    500
}

fn default_endpointing_ms() -> u64 {
    500
}

impl Default for InterruptionThresholds {
    fn default() -> Self {
        Self {
            min_speech_duration_to_interrupt_ms: default_min_interrupt_ms(),
            min_words_to_interrupt: 0,
            min_endpointing_delay_ms: default_endpointing_ms(),
        }
    }
}

impl InterruptionThresholds {
    pub fn new(
        min_speech_duration_to_interrupt: Duration,
        min_words_to_interrupt: usize,
        min_endpointing_delay: Duration,
    ) -> Self {
        Self {
            min_speech_duration_to_interrupt_ms: min_speech_duration_to_interrupt.as_millis() as u64,
            min_words_to_interrupt,
            min_endpointing_delay_ms: min_endpointing_delay.as_millis() as u64,
        }
    }

    pub fn min_speech_duration_to_interrupt(&self) -> Duration {
        Duration::from_millis(self.min_speech_duration_to_interrupt_ms)
    }

    pub fn min_endpointing_delay(&self) -> Duration {
        Duration::from_millis(self.min_endpointing_delay_ms)
    }
}

/// Full configuration for one voice session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub thresholds: InterruptionThresholds,
    /// Capacity of the lossy capture queue (frames).
    #[serde(default = "default_audio_queue")]
    pub audio_queue_frames: usize,
    /// Capacity of the detector input queue (frames). Overflow is dropped.
    #[serde(default = "default_audio_queue")]
    pub detector_queue_frames: usize,
    /// Capacity of each speech segment's transcriber feed (frames).
    #[serde(default = "default_segment_queue")]
    pub segment_queue_frames: usize,
    /// Frames kept before speech start and replayed into the new segment.
    #[serde(default = "default_preroll")]
    pub preroll_frames: usize,
    /// Capacity of the controller event queue.
    #[serde(default = "default_control_queue")]
    pub control_queue: usize,
    /// Capacity of the response-text → synthesis queue (chunks).
    #[serde(default = "default_synthesis_queue")]
    pub synthesis_queue: usize,
    /// Shortest chunk handed to the synthesizer unless the response ends.
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    #[serde(default = "default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,
    #[serde(default = "default_transcript_timeout_ms")]
    pub transcript_timeout_ms: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

fn default_audio_queue() -> usize {
    64
}

fn default_segment_queue() -> usize {
    256
}

fn default_preroll() -> usize {
    10
}

fn default_control_queue() -> usize {
    128
}

fn default_synthesis_queue() -> usize {
    8
}

fn default_min_chunk_chars() -> usize {
    20
}

fn default_cancel_grace_ms() -> u64 {
    500
}

fn default_generation_timeout_ms() -> u64 {
    15_000
}

fn default_synthesis_timeout_ms() -> u64 {
    10_000
}

fn default_transcript_timeout_ms() -> u64 {
    3_000
}

fn default_max_tool_rounds() -> usize {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thresholds: InterruptionThresholds::default(),
            audio_queue_frames: default_audio_queue(),
            detector_queue_frames: default_audio_queue(),
            segment_queue_frames: default_segment_queue(),
            preroll_frames: default_preroll(),
            control_queue: default_control_queue(),
            synthesis_queue: default_synthesis_queue(),
            min_chunk_chars: default_min_chunk_chars(),
            cancel_grace_ms: default_cancel_grace_ms(),
            generation_timeout_ms: default_generation_timeout_ms(),
            synthesis_timeout_ms: default_synthesis_timeout_ms(),
            transcript_timeout_ms: default_transcript_timeout_ms(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

impl SessionConfig {
    /// Defaults with the given thresholds.
    pub fn with_thresholds(thresholds: InterruptionThresholds) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    /// Load from environment. Unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let thresholds = InterruptionThresholds {
            min_speech_duration_to_interrupt_ms: env_u64(
                "PAGI_TURNS_MIN_INTERRUPT_MS",
                defaults.thresholds.min_speech_duration_to_interrupt_ms,
            ),
            min_words_to_interrupt: env_usize(
                "PAGI_TURNS_MIN_INTERRUPT_WORDS",
                defaults.thresholds.min_words_to_interrupt,
            ),
            min_endpointing_delay_ms: env_u64(
                "PAGI_TURNS_ENDPOINTING_MS",
                defaults.thresholds.min_endpointing_delay_ms,
            ),
        };
        Self {
            thresholds,
            cancel_grace_ms: env_u64("PAGI_TURNS_CANCEL_GRACE_MS", defaults.cancel_grace_ms).max(1),
            generation_timeout_ms: env_u64(
                "PAGI_TURNS_GENERATION_TIMEOUT_MS",
                defaults.generation_timeout_ms,
            ),
            synthesis_timeout_ms: env_u64(
                "PAGI_TURNS_SYNTHESIS_TIMEOUT_MS",
                defaults.synthesis_timeout_ms,
            ),
            transcript_timeout_ms: env_u64(
                "PAGI_TURNS_TRANSCRIPT_TIMEOUT_MS",
                defaults.transcript_timeout_ms,
            ),
            max_tool_rounds: env_usize("PAGI_TURNS_MAX_TOOL_ROUNDS", defaults.max_tool_rounds),
            ..defaults
        }
    }

    /// Layered load. Precedence: `PAGI_TURNS__*` env > TOML file (`PAGI_TURNS_CONFIG`,
    /// default `config/turns`) > defaults.
    pub fn load() -> TurnResult<Self> {
        let config_path =
            std::env::var("PAGI_TURNS_CONFIG").unwrap_or_else(|_| "config/turns".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Same as [`SessionConfig::load`] with an explicit file path.
    pub fn load_from(path: &Path) -> TurnResult<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let built = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("PAGI_TURNS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> TurnResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipelines cannot run with.
    pub fn validate(&self) -> TurnResult<()> {
        let queues = [
            ("audio_queue_frames", self.audio_queue_frames),
            ("detector_queue_frames", self.detector_queue_frames),
            ("segment_queue_frames", self.segment_queue_frames),
            ("control_queue", self.control_queue),
            ("synthesis_queue", self.synthesis_queue),
        ];
        for (name, size) in queues {
            if size == 0 {
                return Err(TurnError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.cancel_grace_ms == 0 {
            return Err(TurnError::Config(
                "cancel_grace_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_tool_rounds == 0 {
            return Err(TurnError::Config(
                "max_tool_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn transcript_timeout(&self) -> Duration {
        Duration::from_millis(self.transcript_timeout_ms)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thresholds.min_speech_duration_to_interrupt(), Duration::from_millis(500));
        assert_eq!(config.thresholds.min_words_to_interrupt, 0);
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let config = SessionConfig::from_toml_str(
            r#"
            cancel_grace_ms = 250

            [thresholds]
            min_speech_duration_to_interrupt_ms = 600
            min_words_to_interrupt = 2
            min_endpointing_delay_ms = 800
            "#,
        )
        .unwrap();
        assert_eq!(config.cancel_grace(), Duration::from_millis(250));
        assert_eq!(
            config.thresholds,
            InterruptionThresholds::new(Duration::from_millis(600), 2, Duration::from_millis(800))
        );
        assert_eq!(config.synthesis_queue, 8);
    }

    #[test]
    fn zero_queue_is_rejected() {
        let err = SessionConfig::from_toml_str("control_queue = 0").unwrap_err();
        assert!(matches!(err, TurnError::Config(_)));
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let config = SessionConfig::load_from(Path::new("does/not/exist/turns")).unwrap();
        assert_eq!(config.max_tool_rounds, 5);
    }
}
