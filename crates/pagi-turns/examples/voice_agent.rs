//! Voice agent demo: microphone → VAD → STT → LLM (with a property search tool) → TTS → speakers.
//!
//! Requires `--features audio` and API keys in `.env`:
//! - `LLM_API_KEY` / `STT_API_KEY` / `TTS_API_KEY`, or one shared `OPENAI_API_KEY` / `PAGI_LLM_API_KEY`.
//! - `VAD_BACKEND=energy` uses the RMS detector instead of WebRTC VAD.
//! - `PAGI_TURNS_CONFIG` points at a TOML file with session thresholds.
//!
//! Talk over the agent to interrupt it. Ctrl+C ends the session and prints the transcript.

use anyhow::Context;
use pagi_turns::{
    tool_fn, AudioConfig, BoxError, Detector, EnergyDetector, Engines, MicrophoneCapture,
    OpenAiGenerator, OpenAiSynthesizer, OpenAiTranscriber, ParamType, RodioPlayback,
    SessionConfig, ToolDefinition, ToolDispatcher, TurnEvent, VadConfig, VoiceSession,
    WebRtcDetector,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SYSTEM_PROMPT: &str = "Sei un agente immobiliare cordiale. Rispondi in italiano, \
con frasi brevi adatte alla voce. Usa search_property per cercare immobili in una zona.";

const GREETING: &str = "Ciao! Sono pronto. Di cosa vogliamo parlare oggi?";

fn property_tools() -> anyhow::Result<ToolDispatcher> {
    let mut tools = ToolDispatcher::new();
    tools.register(
        ToolDefinition::new("search_property", "Cerca immobili in vendita in una zona della città")
            .param("zona", ParamType::String, "Quartiere o zona, ad esempio Centro", true)
            .param("max_prezzo", ParamType::Integer, "Prezzo massimo in euro", false),
        tool_fn(|args| async move {
            let zona = args["zona"].as_str().unwrap_or_default().to_string();
            let max = args["max_prezzo"].as_i64().unwrap_or(i64::MAX);
            let listings: Vec<_> = [
                ("Trilocale luminoso", 245_000),
                ("Bilocale ristrutturato", 180_000),
                ("Attico con terrazzo", 420_000),
            ]
            .into_iter()
            .filter(|(_, price)| *price <= max)
            .map(|(title, price)| json!({ "titolo": title, "zona": zona, "prezzo": price }))
            .collect();
            Ok::<_, BoxError>(json!({ "risultati": listings }).to_string())
        }),
    )?;
    Ok(tools)
}

fn detector(vad: VadConfig) -> anyhow::Result<Arc<dyn Detector>> {
    let backend = std::env::var("VAD_BACKEND").unwrap_or_default();
    if backend.eq_ignore_ascii_case("energy") {
        info!("VAD: energy threshold");
        return Ok(Arc::new(EnergyDetector::new(vad)?));
    }
    info!("VAD: WebRTC");
    Ok(Arc::new(WebRtcDetector::new(vad)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pagi_turns=debug")),
        )
        .init();

    let config = SessionConfig::load().context("loading session config")?;
    let engines = Engines {
        detector: detector(VadConfig::default())?,
        transcriber: Arc::new(OpenAiTranscriber::from_env()?),
        generator: Arc::new(OpenAiGenerator::from_env()?),
        synthesizer: Arc::new(OpenAiSynthesizer::from_env()?),
        playback: Arc::new(RodioPlayback::new()?),
        shutdown: None,
    };

    let session = VoiceSession::start(engines, config, SYSTEM_PROMPT, property_tools()?).await?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TurnEvent::UserTurnCommitted { text } => info!("🧑 {}", text),
                TurnEvent::AgentResponseCommitted { text } => info!("🤖 {}", text),
                TurnEvent::ToolInvoked { name, is_error } => info!("🔧 {} (error: {})", name, is_error),
                TurnEvent::Interrupted { speech, words } => {
                    info!("⚡ Interrupted after {:?} ({} words)", speech, words)
                }
                TurnEvent::Error(e) => warn!("⚠️ {}", e),
                TurnEvent::Shutdown => break,
                _ => {}
            }
        }
    });

    // The capture stream is not Send; it stays on this task until shutdown.
    let _capture = MicrophoneCapture::new(AudioConfig::default())?.start(session.audio_input())?;
    session.say(GREETING, true).await?;

    info!("Listening. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    let snapshot = session.stop().await?;
    if session.dropped_frames() > 0 {
        warn!("{} audio frames dropped during the session", session.dropped_frames());
    }
    println!("{}", snapshot.to_json()?);
    Ok(())
}
