//! Audio capture and playback using CPAL and Rodio
//!
//! Capture pushes fixed-size frames into a session's [`AudioInput`]; playback is a
//! [`PlaybackSink`] that can be cut off mid-sentence when the user barges in.

use crate::engines::{AudioFrame, PlaybackSink};
use crate::error::{TurnError, TurnResult};
use crate::pipeline::AudioInput;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels captured (default: 1). Frames are always downmixed to mono.
    pub channels: u16,

    /// Frame size in samples (default: 480 for 30ms at 16kHz)
    pub frame_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_samples: 480,
        }
    }
}

/// Microphone capture using CPAL
pub struct MicrophoneCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl MicrophoneCapture {
    pub fn new(config: AudioConfig) -> TurnResult<Self> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} channels)",
            config.sample_rate, config.channels
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| TurnError::AudioDevice("No input device available".to_string()))?;

        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing into `input`. Keep the returned stream alive for as long as
    /// capture should run; it is not `Send`.
    pub fn start(self, input: AudioInput) -> TurnResult<Stream> {
        info!("▶️ Starting audio capture stream");

        let frame_samples = self.config.frame_samples;
        let channels = usize::from(self.config.channels.max(1));
        let sample_rate = self.config.sample_rate;
        let mut pending = Vec::with_capacity(frame_samples);
        let mut captured: u64 = 0;

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for chunk in data.chunks(channels) {
                        pending.push(chunk.iter().sum::<f32>() / chunk.len() as f32);
                        if pending.len() >= frame_samples {
                            let timestamp =
                                Duration::from_secs_f64(captured as f64 / sample_rate as f64);
                            captured += pending.len() as u64;
                            let samples = std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(frame_samples),
                            );
                            input.push(AudioFrame::new(samples, sample_rate, timestamp));
                        }
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| TurnError::AudioDevice(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TurnError::AudioDevice(e.to_string()))?;

        info!("✅ Audio capture started");
        Ok(stream)
    }

    pub fn list_input_devices() -> TurnResult<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| TurnError::AudioDevice(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

/// Speaker output through Rodio.
///
/// The output stream lives on a dedicated thread. A stop replaces the sink so the
/// next response starts on an empty queue.
pub struct RodioPlayback {
    handle: OutputStreamHandle,
    sink: Mutex<Arc<Sink>>,
    max_queued: usize,
    // Dropping this releases the output thread.
    _keepalive: std::sync::mpsc::Sender<()>,
}

impl RodioPlayback {
    pub fn new() -> TurnResult<Self> {
        info!("🔊 Initializing audio playback");

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (keepalive, parked) = std::sync::mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("pagi-playback".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((_stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Blocks until the playback handle is dropped.
                    let _ = parked.recv();
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(TurnError::Playback(e.to_string())));
                }
            })
            .map_err(|e| TurnError::Playback(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| TurnError::Playback("output thread exited".to_string()))??;
        let sink = Sink::try_new(&handle).map_err(|e| TurnError::Playback(e.to_string()))?;

        info!("✅ Audio playback initialized");
        Ok(Self {
            handle,
            sink: Mutex::new(Arc::new(sink)),
            max_queued: 4,
            _keepalive: keepalive,
        })
    }

    fn current(&self) -> Arc<Sink> {
        Arc::clone(&self.sink.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_playing(&self) -> bool {
        !self.current().empty()
    }
}

#[async_trait::async_trait]
impl PlaybackSink for RodioPlayback {
    async fn play(&self, frame: AudioFrame) -> TurnResult<()> {
        let sink = self.current();
        let wait = frame.duration().max(Duration::from_millis(5));
        while sink.len() >= self.max_queued {
            tokio::time::sleep(wait).await;
        }
        sink.append(SamplesBuffer::new(1, frame.sample_rate, frame.samples));
        Ok(())
    }

    async fn drain(&self) -> TurnResult<()> {
        let sink = self.current();
        while !sink.empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    fn stop(&self) {
        let mut guard = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        guard.stop();
        match Sink::try_new(&self.handle) {
            Ok(fresh) => *guard = Arc::new(fresh),
            Err(e) => warn!("⚠️ Could not recreate playback sink: {}", e),
        }
        info!("⏹️ Audio playback stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_samples, 480);
    }

    #[test]
    fn test_list_devices() {
        // May fail in CI environments without audio devices
        if let Ok(devices) = MicrophoneCapture::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
