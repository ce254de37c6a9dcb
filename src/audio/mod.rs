//! Audio plumbing: capture, playback, and the TTS-to-player staging queue.

pub mod capture;
pub mod playback;
pub mod staging;
