//! Voice activity detection using RMS energy analysis.
//!
//! Energy thresholding with frame-count hysteresis: speech-start needs a
//! sustained supra-threshold run, speech-end a sustained sub-threshold run,
//! so a single noisy chunk flips nothing. A model-backed detector can bind
//! behind the same [`Vad`] contract.

use crate::config::VadConfig;
use crate::messages::MicFrame;
use crate::traits::Vad;
use tracing::debug;

/// RMS-energy voice activity detector with hysteresis.
///
/// Runs on the microphone thread; never blocks. The threshold arrives per
/// call because it depends on the conversation state (elevated while the
/// assistant speaks).
pub struct EnergyVad {
    attack_frames: u32,
    release_frames: u32,
    speech_run: u32,
    silence_run: u32,
    in_speech: bool,
}

impl EnergyVad {
    /// Create a detector with the configured hysteresis windows.
    pub fn new(config: &VadConfig) -> Self {
        Self {
            attack_frames: config.attack_frames.max(1),
            release_frames: config.release_frames.max(1),
            speech_run: 0,
            silence_run: 0,
            in_speech: false,
        }
    }
}

impl Vad for EnergyVad {
    fn is_speech(&mut self, frame: &MicFrame, threshold: f32) -> bool {
        let rms = rms_energy(&frame.samples);
        if rms > threshold {
            self.speech_run = self.speech_run.saturating_add(1);
            self.silence_run = 0;
        } else {
            self.silence_run = self.silence_run.saturating_add(1);
            self.speech_run = 0;
        }

        if !self.in_speech && self.speech_run >= self.attack_frames {
            self.in_speech = true;
            debug!(rms, threshold, "VAD: speech start");
        } else if self.in_speech && self.silence_run >= self.release_frames {
            self.in_speech = false;
            debug!(rms, threshold, "VAD: speech end");
        }
        self.in_speech
    }

    fn reset(&mut self) {
        self.speech_run = 0;
        self.silence_run = 0;
        self.in_speech = false;
    }
}

/// RMS energy of a sample buffer.
fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Instant;

    fn frame(amplitude: f32) -> MicFrame {
        MicFrame {
            samples: vec![amplitude; 512],
            sample_rate: 16_000,
            captured_at: Instant::now(),
        }
    }

    fn vad() -> EnergyVad {
        EnergyVad::new(&VadConfig {
            threshold_normal: 0.01,
            threshold_speaking: 0.035,
            attack_frames: 3,
            release_frames: 4,
        })
    }

    #[test]
    fn speech_requires_sustained_energy() {
        let mut vad = vad();
        assert!(!vad.is_speech(&frame(0.5), 0.01));
        assert!(!vad.is_speech(&frame(0.5), 0.01));
        // Third consecutive loud frame crosses the attack window.
        assert!(vad.is_speech(&frame(0.5), 0.01));
    }

    #[test]
    fn single_spike_does_not_trigger() {
        let mut vad = vad();
        assert!(!vad.is_speech(&frame(0.5), 0.01));
        assert!(!vad.is_speech(&frame(0.0), 0.01));
        assert!(!vad.is_speech(&frame(0.5), 0.01));
        assert!(!vad.is_speech(&frame(0.5), 0.01));
    }

    #[test]
    fn release_needs_sustained_silence() {
        let mut vad = vad();
        for _ in 0..3 {
            vad.is_speech(&frame(0.5), 0.01);
        }
        // Three quiet frames: still inside the release window.
        for _ in 0..3 {
            assert!(vad.is_speech(&frame(0.0), 0.01));
        }
        // Fourth quiet frame ends the speech run.
        assert!(!vad.is_speech(&frame(0.0), 0.01));
    }

    #[test]
    fn elevated_threshold_suppresses_quiet_speech() {
        let mut vad = vad();
        // 0.02 RMS clears the normal threshold but not the speaking one.
        for _ in 0..5 {
            assert!(!vad.is_speech(&frame(0.02), 0.035));
        }
        for _ in 0..2 {
            vad.is_speech(&frame(0.02), 0.01);
        }
        assert!(vad.is_speech(&frame(0.02), 0.01));
    }

    #[test]
    fn reset_clears_state() {
        let mut vad = vad();
        for _ in 0..3 {
            vad.is_speech(&frame(0.5), 0.01);
        }
        vad.reset();
        assert!(!vad.is_speech(&frame(0.5), 0.01));
    }

    #[test]
    fn empty_frame_is_silence() {
        let mut vad = vad();
        let empty = MicFrame {
            samples: Vec::new(),
            sample_rate: 16_000,
            captured_at: Instant::now(),
        };
        assert!(!vad.is_speech(&empty, 0.01));
    }
}
