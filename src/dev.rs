//! Loopback collaborators for running the pipeline without remote services.
//!
//! `sori` with `SORI_MODE=loopback` (the default when no API key is set)
//! wires these in: utterances are acknowledged with a canned reply and
//! synthesized as a sine burst, exercising the full mic → VAD → turn →
//! speaker path end-to-end on one machine.

use crate::config::AudioConfig;
use crate::error::Result;
use crate::messages::{
    LlmEvent, Message, MicFrame, SttEvent, SystemBlock, ToolDef, TranscriptEvent, TranscriptKind,
};
use crate::traits::{LanguageModel, LlmStream, SpeechToText, TextToSpeech, TtsStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Silence gap after which a loopback utterance commits.
const UTTERANCE_GAP: Duration = Duration::from_millis(800);

/// Minimum forwarded frames for an utterance to count.
const MIN_UTTERANCE_FRAMES: usize = 6;

/// STT stand-in: commits a fixed transcript once frames stop arriving.
///
/// Has no recognizer; the committed text just proves the path. A watchdog
/// task emits `Final` + `UtteranceEnd` after [`UTTERANCE_GAP`] of silence.
pub struct LoopbackStt {
    frame_tx: Option<mpsc::UnboundedSender<()>>,
}

impl LoopbackStt {
    pub fn new() -> Self {
        Self { frame_tx: None }
    }
}

impl Default for LoopbackStt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechToText for LoopbackStt {
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<SttEvent>> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<()>();
        self.frame_tx = Some(frame_tx);

        let _ = event_tx.send(SttEvent::SessionStarted);
        tokio::spawn(async move {
            let mut frames = 0usize;
            loop {
                match tokio::time::timeout_at(Instant::now() + UTTERANCE_GAP, frame_rx.recv())
                    .await
                {
                    Ok(Some(())) => frames += 1,
                    Ok(None) => break,
                    Err(_) => {
                        if frames >= MIN_UTTERANCE_FRAMES {
                            let _ = event_tx.send(SttEvent::Transcript(TranscriptEvent {
                                kind: TranscriptKind::Final,
                                text: "(루프백 음성 입력)".to_owned(),
                            }));
                            let _ = event_tx.send(SttEvent::UtteranceEnd);
                        }
                        frames = 0;
                    }
                }
            }
        });
        Ok(event_rx)
    }

    async fn send_frame(&mut self, _frame: &MicFrame) -> Result<()> {
        if let Some(tx) = &self.frame_tx {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.frame_tx = None;
        Ok(())
    }
}

/// LLM stand-in: acknowledges the last user utterance in one sentence.
pub struct LoopbackLlm {
    cancelled: Arc<AtomicBool>,
}

impl LoopbackLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl LanguageModel for LoopbackLlm {
    async fn stream(
        &self,
        _system: &[SystemBlock],
        _tools: &[ToolDef],
        messages: &[Message],
    ) -> Result<LlmStream> {
        let heard = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::messages::Role::User)
            .map(|m| m.content.text())
            .unwrap_or_default();
        self.cancelled.store(false, Ordering::SeqCst);
        let cancelled = Arc::clone(&self.cancelled);

        Ok(Box::pin(async_stream::stream! {
            let reply = format!("방금 들은 건 {heard} 이야. 파이프라인은 정상이야.");
            for piece in reply.split_inclusive(' ') {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                yield Ok(LlmEvent::TextDelta(piece.to_owned()));
            }
            yield Ok(LlmEvent::Stop);
        }))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// TTS stand-in: a 440Hz sine burst sized to the sentence length.
pub struct ToneTts {
    sample_rate: u32,
}

impl ToneTts {
    pub fn new(audio: &AudioConfig) -> Arc<Self> {
        Arc::new(Self {
            sample_rate: audio.output_sample_rate,
        })
    }
}

#[async_trait]
impl TextToSpeech for ToneTts {
    async fn stream(&self, text: &str) -> Result<TtsStream> {
        // ~45ms of tone per character, in 20ms frames.
        let total_ms = (text.chars().count() as u64).saturating_mul(45).clamp(200, 4_000);
        let frame_ms = 20u64;
        let frames = total_ms / frame_ms;
        let samples_per_frame = (u64::from(self.sample_rate) * frame_ms / 1_000) as usize;
        let sample_rate = self.sample_rate;

        Ok(Box::pin(async_stream::stream! {
            let mut phase = 0.0f32;
            let step = 2.0 * std::f32::consts::PI * 440.0 / sample_rate as f32;
            for _ in 0..frames {
                let mut pcm = Vec::with_capacity(samples_per_frame * 2);
                for _ in 0..samples_per_frame {
                    let sample = (phase.sin() * 0.2 * f32::from(i16::MAX)) as i16;
                    pcm.extend_from_slice(&sample.to_le_bytes());
                    phase += step;
                }
                yield Ok(Bytes::from(pcm));
            }
        }))
    }

    async fn flush(&self) {}
}
