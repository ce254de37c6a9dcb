//! Speaker output via cpal, implementing the [`Player`] contract.
//!
//! cpal streams are not `Send`, so a dedicated audio thread owns the device
//! and output stream; the async trait methods talk to it over a command
//! channel. PCM arrives as i16 little-endian mono bytes at the configured
//! output rate and is converted to f32 for the device.

use crate::config::AudioConfig;
use crate::error::{OrchestratorError, Result};
use crate::messages::PcmChunk;
use crate::traits::Player;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

enum SinkCommand {
    Start(oneshot::Sender<Result<()>>),
    Play(PcmChunk),
    /// Wait for the queue to drain, then reply.
    Finish(oneshot::Sender<()>),
    /// Discard queued audio immediately.
    Kill,
}

/// cpal-backed speaker sink.
pub struct CpalPlayer {
    commands: std_mpsc::Sender<SinkCommand>,
}

impl CpalPlayer {
    /// Spawn the audio thread for the configured output device.
    ///
    /// Device lookup happens lazily on `start`, so construction succeeds on
    /// machines without audio (the first `start` reports the real error).
    pub fn new(config: &AudioConfig) -> Self {
        let (tx, rx) = std_mpsc::channel();
        let config = config.clone();
        std::thread::Builder::new()
            .name("sori-playback".into())
            .spawn(move || sink_thread(&config, &rx))
            .map_err(|e| error!("failed to spawn playback thread: {e}"))
            .ok();
        Self { commands: tx }
    }

    fn send(&self, command: SinkCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| OrchestratorError::Audio("playback thread gone".into()))
    }
}

#[async_trait]
impl Player for CpalPlayer {
    async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SinkCommand::Start(tx))?;
        rx.await
            .map_err(|_| OrchestratorError::Audio("playback thread gone".into()))?
    }

    async fn play(&self, pcm: PcmChunk) -> Result<()> {
        self.send(SinkCommand::Play(pcm))
    }

    async fn finish(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SinkCommand::Finish(tx))?;
        rx.await
            .map_err(|_| OrchestratorError::Audio("playback thread gone".into()))
    }

    async fn kill(&self) {
        let _ = self.send(SinkCommand::Kill);
    }
}

struct SinkState {
    queue: Arc<Mutex<VecDeque<f32>>>,
    stream: Option<cpal::Stream>,
}

fn sink_thread(config: &AudioConfig, rx: &std_mpsc::Receiver<SinkCommand>) {
    let mut state = SinkState {
        queue: Arc::new(Mutex::new(VecDeque::new())),
        stream: None,
    };

    while let Ok(command) = rx.recv() {
        match command {
            SinkCommand::Start(reply) => {
                let result = if state.stream.is_some() {
                    Ok(())
                } else {
                    build_stream(config, &state.queue).map(|stream| {
                        state.stream = Some(stream);
                    })
                };
                let _ = reply.send(result);
            }
            SinkCommand::Play(pcm) => {
                let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.extend(pcm_i16le_to_f32(&pcm));
            }
            SinkCommand::Finish(reply) => {
                // Poll until the device callback has consumed everything.
                loop {
                    let remaining = {
                        let queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                        queue.len()
                    };
                    if remaining == 0 {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                let _ = reply.send(());
            }
            SinkCommand::Kill => {
                let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.clear();
            }
        }
    }
}

fn build_stream(
    config: &AudioConfig,
    queue: &Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream> {
    let device = resolve_output_device(config.output_device.as_deref())?;
    let device_name = match device.description() {
        Ok(desc) => desc.name().to_owned(),
        Err(_) => "unknown-device".to_owned(),
    };
    info!(
        "speaker sink: {device_name} @ {}Hz mono",
        config.output_sample_rate
    );

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let queue = Arc::clone(queue);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut queue = match queue.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    *sample = queue.pop_front().unwrap_or(0.0);
                }
            },
            move |err| {
                warn!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| OrchestratorError::Audio(format!("output stream setup failed: {e}")))?;

    stream
        .play()
        .map_err(|e| OrchestratorError::Audio(format!("output stream would not start: {e}")))?;
    Ok(stream)
}

/// Pick the configured output device, falling back to the system default
/// when the name no longer matches anything (devices come and go).
fn resolve_output_device(wanted: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(wanted) = wanted {
        let hit = host
            .output_devices()
            .map_err(|e| {
                OrchestratorError::Audio(format!("output device enumeration failed: {e}"))
            })?
            .find(|d| d.description().is_ok_and(|desc| desc.name() == wanted));
        match hit {
            Some(device) => return Ok(device),
            None => warn!("output device '{wanted}' is gone, using the system default"),
        }
    }

    host.default_output_device()
        .ok_or_else(|| OrchestratorError::Audio("no output device on this host".into()))
}

/// Decode i16 little-endian mono bytes to f32 samples in [-1, 1].
fn pcm_i16le_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn decodes_i16le_pairs() {
        // 0x0000 = 0.0, 0x7FFF ~= 1.0, 0x8000 = -1.0
        let bytes = [0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80];
        let samples = pcm_i16le_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.99997).abs() < 1e-4);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn odd_trailing_byte_ignored() {
        let bytes = [0x00, 0x00, 0x12];
        assert_eq!(pcm_i16le_to_f32(&bytes).len(), 1);
    }
}
