//! **OpenAI-compatible engines** - streaming chat completions, speech synthesis and
//! transcription over HTTP.
//!
//! Works against OpenAI, OpenRouter or any server speaking the same wire format.
//! Endpoints and keys come from the environment (see [`ApiConfig`]).

use crate::context::{ConversationMessage, Role};
use crate::engines::{
    AudioFrame, EngineStream, FrameStream, GenerationRequest, Generator, GeneratorEvent,
    Synthesizer, TranscriptEvent, Transcriber,
};
use crate::error::{TurnError, TurnResult};
use crate::tools::{ToolDefinition, ToolInvocation};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Sample rate of the `pcm` response format of the speech endpoint (s16le mono).
pub const TTS_PCM_SAMPLE_RATE: u32 = 24_000;

/// 20 ms at 24 kHz.
const TTS_FRAME_SAMPLES: usize = 480;

/// Endpoint, key and model for one API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Read `{PREFIX}_API_URL`, `{PREFIX}_API_KEY` and `{PREFIX}_MODEL`, falling back to
    /// `PAGI_LLM_API_KEY`, `OPENROUTER_API_KEY` or `OPENAI_API_KEY` for the key.
    pub fn from_env(prefix: &str, default_model: &str) -> TurnResult<Self> {
        let base_url = std::env::var(format!("{prefix}_API_URL"))
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = std::env::var(format!("{prefix}_API_KEY"))
            .or_else(|_| std::env::var("PAGI_LLM_API_KEY"))
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                TurnError::Config(format!(
                    "{prefix} requires {prefix}_API_KEY, PAGI_LLM_API_KEY, OPENROUTER_API_KEY or OPENAI_API_KEY"
                ))
            })?;
        let model = std::env::var(format!("{prefix}_MODEL"))
            .unwrap_or_else(|_| default_model.to_string());
        Ok(Self::new(base_url, api_key, model))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

fn http_client(timeout: Option<Duration>) -> TurnResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| TurnError::Config(format!("HTTP client: {e}")))
}

async fn error_body(res: reqwest::Response) -> String {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    format!("API error {status}: {body}")
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Map the conversation log to chat-completions messages.
pub fn chat_messages(messages: &[ConversationMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match (msg.role, &msg.tool_call) {
            (Role::System, _) => json!({ "role": "system", "content": msg.content }),
            (Role::User, _) => json!({ "role": "user", "content": msg.content }),
            (Role::Agent, Some(call)) => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                }]
            }),
            (Role::Agent, None) => json!({ "role": "assistant", "content": msg.content }),
            (Role::Tool, call) => json!({
                "role": "tool",
                "tool_call_id": call.as_ref().map(|c| c.id.as_str()).unwrap_or_default(),
                "content": msg.content,
            }),
        })
        .collect()
}

/// Function specs advertised in the request.
pub fn tool_specs(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.json_schema(),
                }
            })
        })
        .collect()
}

/// Splits a server-sent-events byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every complete `data:` payload seen so far.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles streamed tool calls from their indexed fragments.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one `delta.tool_calls[]` entry.
    pub fn push(&mut self, fragment: &Value) {
        let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
        let call = self.calls.entry(index).or_default();
        if let Some(id) = fragment.get("id").and_then(Value::as_str) {
            call.id = id.to_string();
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                call.name.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                call.arguments.push_str(args);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed invocations in index order. Arguments that are not valid JSON are
    /// passed through as a string so argument validation can reject them.
    pub fn finish(&mut self) -> Vec<ToolInvocation> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| {
                let arguments = if call.arguments.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments))
                };
                if call.id.is_empty() {
                    ToolInvocation::new(call.name, arguments)
                } else {
                    ToolInvocation::with_id(call.id, call.name, arguments)
                }
            })
            .collect()
    }
}

/// Apply one streamed chunk. Returns text deltas and, once the model signals
/// `finish_reason`, the accumulated tool calls.
fn apply_chunk(chunk: &Value, calls: &mut ToolCallAccumulator) -> Vec<GeneratorEvent> {
    let mut events = Vec::new();
    let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
        return events;
    };
    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(GeneratorEvent::TextDelta(text.to_string()));
            }
        }
        if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in fragments {
                calls.push(fragment);
            }
        }
    }
    if choice.get("finish_reason").is_some_and(|r| !r.is_null()) {
        events.extend(calls.finish().into_iter().map(GeneratorEvent::ToolCall));
    }
    events
}

/// Decode a chat-completions body into generator events until `[DONE]`, the end of
/// the body or cancellation.
async fn forward_chat_stream<S, B, E>(
    bytes: S,
    cancel: CancellationToken,
    tx: mpsc::Sender<TurnResult<GeneratorEvent>>,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut bytes = Box::pin(bytes);
    let mut sse = SseDecoder::new();
    let mut calls = ToolCallAccumulator::new();
    'body: loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = bytes.next() => next,
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                let _ = tx.send(Err(TurnError::GenerationFailure(e.to_string()))).await;
                return;
            }
            None => break,
        };
        for payload in sse.push(chunk.as_ref()) {
            if payload == "[DONE]" {
                break 'body;
            }
            let value: Value = match serde_json::from_str(&payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!("⚠️ Skipping malformed stream chunk: {}", e);
                    continue;
                }
            };
            for event in apply_chunk(&value, &mut calls) {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        }
    }
    // Some servers close without a finish_reason.
    for call in calls.finish() {
        if tx.send(Ok(GeneratorEvent::ToolCall(call))).await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Streaming chat-completions generator with function calling.
pub struct OpenAiGenerator {
    config: ApiConfig,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: ApiConfig) -> TurnResult<Self> {
        Ok(Self {
            config,
            temperature: 0.7,
            client: http_client(None)?,
        })
    }

    /// `LLM_API_URL`, `LLM_API_KEY`, `LLM_MODEL` (or `PAGI_LLM_MODEL`, default gpt-4o-mini).
    pub fn from_env() -> TurnResult<Self> {
        let default_model =
            std::env::var("PAGI_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Self::new(ApiConfig::from_env("LLM", &default_model)?)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": chat_messages(&request.messages),
            "temperature": self.temperature,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(tool_specs(&request.tools));
        }
        body
    }
}

#[async_trait::async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest) -> TurnResult<EngineStream<GeneratorEvent>> {
        let body = self.request_body(&request);
        debug!("🧠 Chat request: {} messages, {} tools", request.messages.len(), request.tools.len());
        let res = self
            .client
            .post(self.config.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TurnError::GenerationFailure(e.to_string()))?;
        if !res.status().is_success() {
            return Err(TurnError::GenerationFailure(error_body(res).await));
        }

        let (tx, rx) = mpsc::channel::<TurnResult<GeneratorEvent>>(64);
        tokio::spawn(forward_chat_stream(res.bytes_stream(), request.cancel, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

/// Cuts a little-endian s16 byte stream into fixed-size f32 frames.
#[derive(Debug)]
struct PcmFramer {
    sample_rate: u32,
    frame_samples: usize,
    carry: Option<u8>,
    pending: Vec<f32>,
    emitted: usize,
}

impl PcmFramer {
    fn new(sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            sample_rate,
            frame_samples,
            carry: None,
            pending: Vec::with_capacity(frame_samples),
            emitted: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        let mut iter = bytes.iter().copied();
        if let Some(lo) = self.carry.take() {
            match iter.next() {
                Some(hi) => self.pending.push(i16::from_le_bytes([lo, hi]) as f32 / 32768.0),
                None => {
                    self.carry = Some(lo);
                    return Vec::new();
                }
            }
        }
        loop {
            match (iter.next(), iter.next()) {
                (Some(lo), Some(hi)) => {
                    self.pending.push(i16::from_le_bytes([lo, hi]) as f32 / 32768.0)
                }
                (Some(lo), None) => {
                    self.carry = Some(lo);
                    break;
                }
                _ => break,
            }
        }
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(self.frame(samples));
        }
        frames
    }

    fn finish(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.pending);
        Some(self.frame(samples))
    }

    fn frame(&mut self, samples: Vec<f32>) -> AudioFrame {
        let timestamp =
            Duration::from_secs_f64(self.emitted as f64 / self.sample_rate as f64);
        self.emitted += samples.len();
        AudioFrame::new(samples, self.sample_rate, timestamp)
    }
}

/// Speech synthesis through `/audio/speech` with raw PCM output.
pub struct OpenAiSynthesizer {
    config: ApiConfig,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiSynthesizer {
    pub fn new(config: ApiConfig, voice: impl Into<String>) -> TurnResult<Self> {
        Ok(Self {
            config,
            voice: voice.into(),
            client: http_client(None)?,
        })
    }

    /// `TTS_API_URL`, `TTS_API_KEY`, `TTS_MODEL` (default tts-1), `TTS_VOICE` (default alloy).
    pub fn from_env() -> TurnResult<Self> {
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        Self::new(ApiConfig::from_env("TTS", "tts-1")?, voice)
    }
}

#[async_trait::async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> TurnResult<EngineStream<AudioFrame>> {
        let body = json!({
            "model": self.config.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        let send = self
            .client
            .post(self.config.endpoint("audio/speech"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send();
        let res = tokio::select! {
            _ = cancel.cancelled() => return Ok(futures::stream::empty().boxed()),
            res = send => res.map_err(|e| TurnError::SynthesisFailure(e.to_string()))?,
        };
        if !res.status().is_success() {
            return Err(TurnError::SynthesisFailure(error_body(res).await));
        }

        let (tx, rx) = mpsc::channel::<TurnResult<AudioFrame>>(32);
        tokio::spawn(async move {
            let mut bytes = Box::pin(res.bytes_stream());
            let mut framer = PcmFramer::new(TTS_PCM_SAMPLE_RATE, TTS_FRAME_SAMPLES);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = bytes.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        for frame in framer.push(&chunk) {
                            if tx.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TurnError::SynthesisFailure(e.to_string()))).await;
                        return;
                    }
                    None => break,
                }
            }
            if let Some(frame) = framer.finish() {
                let _ = tx.send(Ok(frame)).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

// ---------------------------------------------------------------------------
// Transcriber
// ---------------------------------------------------------------------------

/// Encode mono f32 PCM as 16-bit WAV for upload.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> TurnResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| TurnError::TranscriptionFailure(e.to_string()))?;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
            writer
                .write_sample(v)
                .map_err(|e| TurnError::TranscriptionFailure(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| TurnError::TranscriptionFailure(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Segment transcription through `/audio/transcriptions`.
///
/// The endpoint is not streaming: audio is buffered until the segment ends and a
/// single final is emitted.
pub struct OpenAiTranscriber {
    config: ApiConfig,
    language: Option<String>,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(config: ApiConfig) -> TurnResult<Self> {
        Ok(Self {
            config,
            language: None,
            client: http_client(Some(Duration::from_secs(30)))?,
        })
    }

    /// `STT_API_URL`, `STT_API_KEY`, `STT_MODEL` (default whisper-1), optional `STT_LANGUAGE`.
    pub fn from_env() -> TurnResult<Self> {
        let mut stt = Self::new(ApiConfig::from_env("STT", "whisper-1")?)?;
        stt.language = std::env::var("STT_LANGUAGE").ok().filter(|l| !l.is_empty());
        Ok(stt)
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    async fn upload(&self, samples: Vec<f32>, sample_rate: u32) -> TurnResult<String> {
        let wav = encode_wav(&samples, sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TurnError::TranscriptionFailure(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }
        let res = self
            .client
            .post(self.config.endpoint("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TurnError::TranscriptionFailure(e.to_string()))?;
        if !res.status().is_success() {
            return Err(TurnError::TranscriptionFailure(error_body(res).await));
        }
        let json: Value = res
            .json()
            .await
            .map_err(|e| TurnError::TranscriptionFailure(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[async_trait::async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(
        &self,
        mut audio: FrameStream,
        cancel: CancellationToken,
    ) -> TurnResult<EngineStream<TranscriptEvent>> {
        let (tx, rx) = mpsc::channel::<TurnResult<TranscriptEvent>>(4);
        let stt = Self {
            config: self.config.clone(),
            language: self.language.clone(),
            client: self.client.clone(),
        };
        tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut sample_rate = 16_000;
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = audio.next() => frame,
                };
                match frame {
                    Some(frame) => {
                        sample_rate = frame.sample_rate;
                        samples.extend_from_slice(&frame.samples);
                    }
                    None => break,
                }
            }
            if samples.is_empty() {
                let _ = tx.send(Ok(TranscriptEvent::Final(String::new()))).await;
                return;
            }
            info!(
                "📝 Transcribing {:.2}s of speech",
                samples.len() as f32 / sample_rate as f32
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = stt.upload(samples, sample_rate) => result,
            };
            let _ = tx.send(result.map(TranscriptEvent::Final)).await;
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConversationContext;

    #[tokio::test]
    async fn chat_stream_ends_at_done_marker() {
        let body: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Ciao\"}}]}\n\ndata: [DONE]\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\" ancora\"}}]}\n\n".to_vec()),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        forward_chat_stream(futures::stream::iter(body), CancellationToken::new(), tx).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event.unwrap());
        }
        assert_eq!(events, vec![GeneratorEvent::TextDelta("Ciao".into())]);
    }

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut sse = SseDecoder::new();
        assert!(sse.push(b"data: {\"a\":").is_empty());
        let out = sse.push(b"1}\n\ndata: [DONE]\r\n: keep-alive\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn accumulator_joins_fragments_by_index() {
        let mut calls = ToolCallAccumulator::new();
        calls.push(&json!({"index": 0, "id": "call_1", "function": {"name": "search_property", "arguments": "{\"zona\""}}));
        calls.push(&json!({"index": 1, "id": "call_2", "function": {"name": "noop", "arguments": ""}}));
        calls.push(&json!({"index": 0, "function": {"arguments": ": \"Centro\"}"}}));

        let done = calls.finish();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].id, "call_1");
        assert_eq!(done[0].name, "search_property");
        assert_eq!(done[0].arguments, json!({"zona": "Centro"}));
        assert_eq!(done[1].arguments, Value::Null);
        assert!(calls.is_empty());
    }

    #[test]
    fn malformed_arguments_pass_through_as_string() {
        let mut calls = ToolCallAccumulator::new();
        calls.push(&json!({"index": 0, "id": "c", "function": {"name": "t", "arguments": "{oops"}}));
        assert_eq!(calls.finish()[0].arguments, Value::String("{oops".into()));
    }

    #[test]
    fn chunk_emits_text_then_calls_on_finish() {
        let mut calls = ToolCallAccumulator::new();
        let text = apply_chunk(&json!({"choices": [{"delta": {"content": "Ciao"}, "finish_reason": null}]}), &mut calls);
        assert_eq!(text, vec![GeneratorEvent::TextDelta("Ciao".into())]);

        apply_chunk(
            &json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "c1", "function": {"name": "t", "arguments": "{}"}}]}}]}),
            &mut calls,
        );
        let done = apply_chunk(&json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}), &mut calls);
        assert!(matches!(&done[..], [GeneratorEvent::ToolCall(inv)] if inv.id == "c1"));
    }

    #[test]
    fn tool_pairs_map_to_assistant_and_tool_roles() {
        let mut ctx = ConversationContext::with_system_prompt("sys").unwrap();
        ctx.append_user("cerca a Centro").unwrap();
        let inv = ToolInvocation::with_id("call_9", "search_property", json!({"zona": "Centro"}));
        ctx.begin_tool_call(&inv).unwrap();
        ctx.complete_tool_call(&inv, "3 risultati", false).unwrap();

        let wire = chat_messages(ctx.messages());
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["role"], "assistant");
        assert_eq!(wire[2]["tool_calls"][0]["id"], "call_9");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], "{\"zona\":\"Centro\"}");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_9");
        assert_eq!(wire[3]["content"], "3 risultati");
    }

    #[test]
    fn pcm_framer_carries_odd_bytes() {
        let mut framer = PcmFramer::new(24_000, 2);
        assert!(framer.push(&[0x00]).is_empty());
        let frames = framer.push(&[0x40, 0x00, 0xC0, 0xFF]);
        assert_eq!(frames.len(), 1);
        assert!((frames[0].samples[0] - 0.5).abs() < 1e-4);
        assert!((frames[0].samples[1] + 0.5).abs() < 1e-4);
        assert_eq!(framer.push(&[0xFF]).len(), 0);
        let tail = framer.finish().unwrap();
        assert_eq!(tail.samples.len(), 1);
        assert_eq!(tail.timestamp, Duration::from_secs_f64(2.0 / 24_000.0));
    }

    #[test]
    fn wav_has_riff_header_and_samples() {
        let wav = encode_wav(&[0.0, 0.5, -0.5], 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[wav.len() - 6..], &[0x00, 0x00, 0x00, 0x40, 0x00, 0xC0]);
    }
}
