//! Microphone audio capture using cpal.
//!
//! Captures at the device's native sample rate, downsamples to the pipeline
//! rate (default 16kHz mono), and feeds fixed-size chunks to the microphone
//! gate. The cpal callback thread is the only place the gate's VAD runs; it
//! never blocks on the scheduler.

use crate::config::AudioConfig;
use crate::error::{OrchestratorError, Result};
use crate::messages::MicFrame;
use crate::orchestrator::MicGate;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Audio capture from the system microphone via cpal.
pub struct MicCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    target_chunk_frames: usize,
}

impl MicCapture {
    /// Create a capture instance, selecting the device by index or falling
    /// back to the system default.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = match config.input_device_index {
            Some(index) => host
                .input_devices()
                .map_err(|e| OrchestratorError::Audio(format!("cannot enumerate devices: {e}")))?
                .nth(index)
                .ok_or_else(|| {
                    OrchestratorError::Audio(format!("input device index {index} not found"))
                })?,
            None => host
                .default_input_device()
                .ok_or_else(|| OrchestratorError::Audio("no default input device".into()))?,
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| OrchestratorError::Audio(format!("no default input config: {e}")))?;
        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        info!("native input config: {native_rate}Hz, {native_channels} channels");

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.input_sample_rate,
            target_chunk_frames: config.chunk_samples,
        })
    }

    /// Run the capture loop, feeding chunks into the microphone gate until
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created or started.
    pub async fn run(&self, mut gate: MicGate, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let chunk_len = self.target_chunk_frames.max(1);
        let mut pending: VecDeque<f32> = VecDeque::with_capacity(chunk_len.saturating_mul(4));

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        fold_to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        resample_linear(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    pending.extend(samples);

                    // Fixed-size chunks keep VAD hysteresis timing stable.
                    while pending.len() >= chunk_len {
                        let chunk: Vec<f32> = pending.drain(..chunk_len).collect();
                        gate.on_audio_frame(MicFrame {
                            samples: chunk,
                            sample_rate: target_rate,
                            captured_at: Instant::now(),
                        });
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| OrchestratorError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| OrchestratorError::Audio(format!("failed to start input stream: {e}")))?;
        info!("microphone capture started: {native_rate}Hz -> {target_rate}Hz");

        cancel.cancelled().await;
        drop(stream);
        info!("microphone capture stopped");
        Ok(())
    }

    /// List available input devices, in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| OrchestratorError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// Fold an interleaved buffer down to mono, one frame at a time.
fn fold_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels).max(1);
    let mut mono = Vec::with_capacity(data.len() / ch);
    let mut offset = 0;
    while offset + ch <= data.len() {
        let mut acc = 0.0f32;
        for sample in &data[offset..offset + ch] {
            acc += sample;
        }
        mono.push(acc / ch as f32);
        offset += ch;
    }
    mono
}

/// Resample by walking a fractional read cursor through the input and
/// linearly interpolating between neighbors.
///
/// Good enough for speech capture: the energy that matters sits well under
/// the 8kHz Nyquist of a 16kHz pipeline, so no anti-alias filter.
fn resample_linear(input: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || input.len() < 2 {
        return input.to_vec();
    }

    let step = f64::from(src_rate) / f64::from(dst_rate);
    let mut out = Vec::with_capacity((input.len() as f64 / step).ceil() as usize);
    let last = input.len() - 1;
    let mut cursor = 0.0f64;

    while (cursor as usize) < last {
        let base = cursor as usize;
        let frac = (cursor - base as f64) as f32;
        let left = input[base];
        out.push(left + (input[base + 1] - left) * frac);
        cursor += step;
    }
    if cursor as usize == last {
        out.push(input[last]);
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn mono_fold_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(fold_to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn mono_fold_drops_ragged_tail() {
        // A torn final frame (3 samples, 2 channels) is not half-averaged.
        let data = [1.0, 1.0, 0.25];
        assert_eq!(fold_to_mono(&data, 2), vec![1.0]);
    }

    #[test]
    fn resample_thirds_length_at_48k_to_16k() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = resample_linear(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn resample_interpolates_between_neighbors() {
        // Upsampling a ramp 2x puts midpoints halfway between neighbors.
        let out = resample_linear(&[0.0, 1.0], 8_000, 16_000);
        assert_eq!(out, vec![0.0, 0.5, 1.0]);
    }
}
