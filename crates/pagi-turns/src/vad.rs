//! Voice Activity Detection
//!
//! Detectors turn the capture stream into speech start/end events. Raw per-window
//! decisions are smoothed by a [`SpeechGate`] so a single loud click or a short
//! breath does not open or close a segment.
//!
//! - [`EnergyDetector`]: RMS threshold, pure Rust, always available.
//! - `WebRtcDetector`: WebRTC VAD, behind the `audio` feature.

use crate::engines::{AudioFrame, Detector, DetectorEvent, EngineStream, FrameStream};
use crate::error::{TurnError, TurnResult};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// WebRTC detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// Analysis window in milliseconds (10, 20 or 30)
    pub window_ms: u32,

    /// Speech must last this long before a segment opens (default: 250ms)
    pub min_speech_duration_ms: u32,

    /// Silence must last this long before a segment closes (default: 300ms)
    pub min_silence_duration_ms: u32,

    /// RMS level above which the energy detector calls a window speech
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 3,
            window_ms: 30,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 300,
            energy_threshold: 0.02,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> TurnResult<()> {
        if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(TurnError::Config(format!(
                "VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                self.sample_rate
            )));
        }
        if !matches!(self.window_ms, 10 | 20 | 30) {
            return Err(TurnError::Config(format!(
                "VAD window must be 10, 20 or 30 ms, got {}",
                self.window_ms
            )));
        }
        if self.mode > 3 {
            return Err(TurnError::Config(format!("VAD mode must be 0-3, got {}", self.mode)));
        }
        Ok(())
    }

    /// Samples per analysis window (480 for 30ms at 16kHz).
    pub fn window_size(&self) -> usize {
        (self.sample_rate as usize * self.window_ms as usize) / 1000
    }

    fn frames_for(&self, ms: u32) -> u32 {
        ms.div_ceil(self.window_ms.max(1)).max(1)
    }
}

/// Hysteresis over per-window speech decisions.
#[derive(Debug, Clone)]
pub struct SpeechGate {
    min_speech_frames: u32,
    min_silence_frames: u32,
    speaking: bool,
    /// A silence run is in progress inside an open segment.
    paused: bool,
    run: u32,
    run_start: Duration,
}

impl SpeechGate {
    pub fn new(min_speech_frames: u32, min_silence_frames: u32) -> Self {
        Self {
            min_speech_frames: min_speech_frames.max(1),
            min_silence_frames: min_silence_frames.max(1),
            speaking: false,
            paused: false,
            run: 0,
            run_start: Duration::ZERO,
        }
    }

    pub fn from_config(config: &VadConfig) -> Self {
        Self::new(
            config.frames_for(config.min_speech_duration_ms),
            config.frames_for(config.min_silence_duration_ms),
        )
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one window decision. Boundaries are stamped with the first window of the run.
    ///
    /// While speaking, the first silent window reports a pause and the next voiced
    /// one a resume, so listeners know the speech stopped before the end is confirmed.
    pub fn update(&mut self, is_speech: bool, at: Duration) -> Option<DetectorEvent> {
        if is_speech == self.speaking {
            self.run = 0;
            if self.paused {
                self.paused = false;
                return Some(DetectorEvent::SpeechResumed { at });
            }
            return None;
        }
        if self.run == 0 {
            self.run_start = at;
        }
        self.run += 1;

        let needed = if self.speaking {
            self.min_silence_frames
        } else {
            self.min_speech_frames
        };
        if self.run < needed {
            if self.speaking && !self.paused {
                self.paused = true;
                return Some(DetectorEvent::SpeechPaused { at: self.run_start });
            }
            return None;
        }

        self.run = 0;
        self.paused = false;
        self.speaking = !self.speaking;
        Some(if self.speaking {
            DetectorEvent::SpeechStart { at: self.run_start }
        } else {
            DetectorEvent::SpeechEnd { at: self.run_start }
        })
    }
}

/// Cuts arbitrary-size capture frames into fixed analysis windows.
#[derive(Debug)]
struct Reframer {
    window: usize,
    sample_rate: u32,
    buffer: Vec<f32>,
    emitted: u64,
}

impl Reframer {
    fn new(window: usize, sample_rate: u32) -> Self {
        Self {
            window: window.max(1),
            sample_rate,
            buffer: Vec::with_capacity(window),
            emitted: 0,
        }
    }

    /// Complete windows with their stream offset.
    fn push(&mut self, frame: &AudioFrame) -> Vec<(Vec<f32>, Duration)> {
        self.buffer.extend_from_slice(&frame.samples);
        let mut windows = Vec::new();
        while self.buffer.len() >= self.window {
            let rest = self.buffer.split_off(self.window);
            let window = std::mem::replace(&mut self.buffer, rest);
            let at = Duration::from_secs_f64(self.emitted as f64 / self.sample_rate.max(1) as f64);
            self.emitted += self.window as u64;
            windows.push((window, at));
        }
        windows
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// RMS-threshold detector. Good enough for a quiet room and for tests.
#[derive(Debug, Clone)]
pub struct EnergyDetector {
    config: VadConfig,
}

impl EnergyDetector {
    pub fn new(config: VadConfig) -> TurnResult<Self> {
        config.validate()?;
        info!(
            "🎙️ Energy VAD ready (threshold {:.3}, {}ms windows)",
            config.energy_threshold, config.window_ms
        );
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl Detector for EnergyDetector {
    async fn start(&self, mut frames: FrameStream) -> TurnResult<EngineStream<DetectorEvent>> {
        let config = self.config.clone();
        let (tx, rx) = mpsc::channel::<TurnResult<DetectorEvent>>(32);

        tokio::spawn(async move {
            let mut reframer = Reframer::new(config.window_size(), config.sample_rate);
            let mut gate = SpeechGate::from_config(&config);
            while let Some(frame) = frames.next().await {
                for (window, at) in reframer.push(&frame) {
                    let level = rms(&window);
                    if let Some(event) = gate.update(level >= config.energy_threshold, at) {
                        debug!("VAD: {:?} (rms {:.3})", event, level);
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(feature = "audio")]
pub use webrtc::WebRtcDetector;

#[cfg(feature = "audio")]
mod webrtc {
    use super::*;
    use webrtc_vad::{SampleRate, Vad, VadMode};

    /// WebRTC VAD. The detector is not `Send`, so it lives on a dedicated thread.
    #[derive(Debug, Clone)]
    pub struct WebRtcDetector {
        config: VadConfig,
    }

    impl WebRtcDetector {
        pub fn new(config: VadConfig) -> TurnResult<Self> {
            config.validate()?;
            info!(
                "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
                config.sample_rate, config.mode
            );
            Ok(Self { config })
        }
    }

    fn build_vad(config: &VadConfig) -> Vad {
        let mode = match config.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };
        let rate = match config.sample_rate {
            8000 => SampleRate::Rate8kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => SampleRate::Rate16kHz,
        };
        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);
        vad
    }

    #[async_trait::async_trait]
    impl Detector for WebRtcDetector {
        async fn start(&self, mut frames: FrameStream) -> TurnResult<EngineStream<DetectorEvent>> {
            let config = self.config.clone();
            let (window_tx, mut window_rx) = mpsc::channel::<(Vec<f32>, Duration)>(64);
            let (event_tx, event_rx) = mpsc::channel(32);

            // Reframing stays on the runtime; classification runs on the VAD thread.
            let window_size = config.window_size();
            let sample_rate = config.sample_rate;
            tokio::spawn(async move {
                let mut reframer = Reframer::new(window_size, sample_rate);
                while let Some(frame) = frames.next().await {
                    for window in reframer.push(&frame) {
                        if window_tx.send(window).await.is_err() {
                            return;
                        }
                    }
                }
            });

            std::thread::Builder::new()
                .name("pagi-webrtc-vad".to_string())
                .spawn(move || {
                    let mut vad = build_vad(&config);
                    let mut gate = SpeechGate::from_config(&config);
                    info!("🔄 VAD processing thread started");

                    while let Some((window, at)) = window_rx.blocking_recv() {
                        let pcm: Vec<i16> = window
                            .iter()
                            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
                            .collect();
                        let is_speech = match vad.is_voice_segment(&pcm) {
                            Ok(is_speech) => is_speech,
                            Err(()) => {
                                let _ = event_tx.blocking_send(Err(TurnError::DetectionFailure(
                                    format!("VAD rejected a {}-sample window", pcm.len()),
                                )));
                                return;
                            }
                        };
                        if let Some(event) = gate.update(is_speech, at) {
                            if event_tx.blocking_send(Ok(event)).is_err() {
                                return;
                            }
                        }
                    }
                    info!("🛑 VAD processing thread ended");
                })
                .map_err(|e| TurnError::DetectionFailure(e.to_string()))?;

            Ok(ReceiverStream::new(event_rx).boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn gate_needs_sustained_speech() {
        let mut gate = SpeechGate::new(3, 2);
        assert_eq!(gate.update(true, ms(0)), None);
        assert_eq!(gate.update(false, ms(30)), None);
        assert_eq!(gate.update(true, ms(60)), None);
        assert_eq!(gate.update(true, ms(90)), None);
        assert_eq!(
            gate.update(true, ms(120)),
            Some(DetectorEvent::SpeechStart { at: ms(60) })
        );
        assert!(gate.is_speaking());

        // A single silent window pauses the segment without closing it.
        assert_eq!(
            gate.update(false, ms(150)),
            Some(DetectorEvent::SpeechPaused { at: ms(150) })
        );
        assert_eq!(
            gate.update(true, ms(180)),
            Some(DetectorEvent::SpeechResumed { at: ms(180) })
        );
        assert_eq!(gate.update(true, ms(200)), None);
        assert_eq!(
            gate.update(false, ms(210)),
            Some(DetectorEvent::SpeechPaused { at: ms(210) })
        );
        assert_eq!(
            gate.update(false, ms(240)),
            Some(DetectorEvent::SpeechEnd { at: ms(210) })
        );
        assert!(!gate.is_speaking());
    }

    #[test]
    fn config_validation() {
        assert!(VadConfig::default().validate().is_ok());
        assert_eq!(VadConfig::default().window_size(), 480);
        let bad_rate = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());
        let bad_window = VadConfig {
            window_ms: 25,
            ..Default::default()
        };
        assert!(bad_window.validate().is_err());
    }

    #[test]
    fn reframer_carries_remainder() {
        let mut reframer = Reframer::new(4, 1000);
        let frame = AudioFrame::new(vec![0.1; 6], 1000, Duration::ZERO);
        let first = reframer.push(&frame);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1, Duration::ZERO);
        let second = reframer.push(&frame);
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].1, ms(8));
    }

    #[tokio::test]
    async fn energy_detector_reports_boundaries() {
        let config = VadConfig {
            min_speech_duration_ms: 60,
            min_silence_duration_ms: 60,
            ..Default::default()
        };
        let detector = EnergyDetector::new(config).unwrap();
        let window = Duration::from_millis(30);
        let mut frames = Vec::new();
        for i in 0..10u32 {
            let level = if (2..6).contains(&i) { 0.3 } else { 0.0 };
            frames.push(AudioFrame::new(vec![level; 480], 16000, window * i));
        }

        let events: Vec<DetectorEvent> = detector
            .start(futures::stream::iter(frames).boxed())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                DetectorEvent::SpeechStart { at: ms(60) },
                DetectorEvent::SpeechPaused { at: ms(180) },
                DetectorEvent::SpeechEnd { at: ms(180) },
            ]
        );
    }
}
