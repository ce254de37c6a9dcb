//! Shared test doubles for the pipeline.
//!
//! Scripted collaborators used by unit tests and the end-to-end scenarios
//! under `tests/`. Each mock records what it was asked to do so tests can
//! assert on ordering and teardown behavior.

use crate::error::{OrchestratorError, Result};
use crate::messages::{
    LlmEvent, Message, MicFrame, PcmChunk, SttEvent, SystemBlock, ToolDef, ToolUse,
};
use crate::traits::{
    LanguageModel, LlmStream, Memory, Player, SpeechToText, TextToSpeech, Tool, TtsStream, Vad,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Create a unique temporary directory for test isolation.
pub fn temp_test_root(prefix: &str, name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let dir = std::env::temp_dir().join(format!(
        "sori-{prefix}-{name}-{}-{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create temp test dir");
    dir
}

// ── VAD ──────────────────────────────────────────────────────────────

/// VAD that never reports speech. Scenario tests post speech events to the
/// orchestrator handle directly.
pub struct NullVad;

impl Vad for NullVad {
    fn is_speech(&mut self, _frame: &MicFrame, _threshold: f32) -> bool {
        false
    }

    fn reset(&mut self) {}
}

// ── STT ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SttShared {
    tx: Mutex<Option<mpsc::UnboundedSender<SttEvent>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    frames_sent: AtomicUsize,
}

/// Test-side driver for a [`MockStt`]: emits events into whatever session
/// the orchestrator currently holds.
#[derive(Clone, Default)]
pub struct SttDriver {
    shared: Arc<SttShared>,
}

impl SttDriver {
    /// Emit one event into the active session.
    pub fn emit(&self, event: SttEvent) {
        let guard = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Convenience: a final transcript followed by utterance end.
    pub fn commit_utterance(&self, text: &str) {
        self.emit(SttEvent::Transcript(crate::messages::TranscriptEvent {
            kind: crate::messages::TranscriptKind::Final,
            text: text.to_owned(),
        }));
        self.emit(SttEvent::UtteranceEnd);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> usize {
        self.shared.frames_sent.load(Ordering::SeqCst)
    }
}

/// Scripted STT session; events come from the paired [`SttDriver`].
pub struct MockStt {
    shared: Arc<SttShared>,
}

impl MockStt {
    pub fn new() -> (Self, SttDriver) {
        let shared = Arc::new(SttShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            SttDriver { shared },
        )
    }
}

#[async_trait]
impl SpeechToText for MockStt {
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<SttEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SttEvent::SessionStarted);
        *self.shared.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send_frame(&mut self, _frame: &MicFrame) -> Result<()> {
        self.shared.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        *self.shared.tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── LLM ──────────────────────────────────────────────────────────────

/// One recorded LLM request, for prompt-assembly assertions.
#[derive(Clone)]
pub struct RecordedRequest {
    pub system: Vec<SystemBlock>,
    pub tools: Vec<ToolDef>,
    pub messages: Vec<Message>,
}

/// LLM double that replays scripted event sequences, one per `stream` call.
///
/// `cancel` terminates the active stream at its next item, mirroring the
/// real client's cancel-at-await-point contract.
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<LlmEvent>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    cancelled: Arc<AtomicBool>,
    event_delay: Option<Duration>,
    fail_stream_open: AtomicBool,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<LlmEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            event_delay: None,
            fail_stream_open: AtomicBool::new(false),
        })
    }

    /// Script a single response that streams `text` delta by delta.
    pub fn with_text_response(text: &str) -> Arc<Self> {
        let mut events: Vec<LlmEvent> = text
            .split_inclusive(' ')
            .map(|piece| LlmEvent::TextDelta(piece.to_owned()))
            .collect();
        events.push(LlmEvent::Stop);
        Self::new(vec![events])
    }

    /// Delay before each streamed event; gives tests a window to barge in.
    pub fn with_event_delay(scripts: Vec<Vec<LlmEvent>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            event_delay: Some(delay),
            fail_stream_open: AtomicBool::new(false),
        })
    }

    /// Make the next `stream` call fail with a transient network error.
    pub fn fail_next_stream(&self) {
        self.fail_stream_open.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn stream(
        &self,
        system: &[SystemBlock],
        tools: &[ToolDef],
        messages: &[Message],
    ) -> Result<LlmStream> {
        if self.fail_stream_open.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::TransientNetwork(
                "scripted stream-open failure".into(),
            ));
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest {
                system: system.to_vec(),
                tools: tools.to_vec(),
                messages: messages.to_vec(),
            });

        let events = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| vec![LlmEvent::Stop]);
        self.cancelled.store(false, Ordering::SeqCst);
        let cancelled = Arc::clone(&self.cancelled);
        let delay = self.event_delay;

        Ok(Box::pin(async_stream::stream! {
            for event in events {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                yield Ok(event);
            }
        }))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

// ── TTS ──────────────────────────────────────────────────────────────

/// TTS double producing a fixed number of tagged PCM frames per sentence.
///
/// Frame payload: `[sentence_index, frame_index, 0xAB, 0xCD]` — tests decode
/// these to assert per-sentence ordering at the player.
pub struct ScriptedTts {
    frames_per_sentence: usize,
    sentence_seq: AtomicUsize,
    sentences: Mutex<Vec<String>>,
    flushes: AtomicUsize,
    fail_containing: Mutex<Option<String>>,
    frame_delay: Option<Duration>,
}

impl ScriptedTts {
    pub fn new(frames_per_sentence: usize) -> Arc<Self> {
        Arc::new(Self {
            frames_per_sentence,
            sentence_seq: AtomicUsize::new(0),
            sentences: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            fail_containing: Mutex::new(None),
            frame_delay: None,
        })
    }

    pub fn with_frame_delay(frames_per_sentence: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            frames_per_sentence,
            sentence_seq: AtomicUsize::new(0),
            sentences: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            fail_containing: Mutex::new(None),
            frame_delay: Some(delay),
        })
    }

    /// Fail synthesis of any sentence containing `needle`.
    pub fn fail_sentences_containing(&self, needle: &str) {
        *self
            .fail_containing
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(needle.to_owned());
    }

    /// Sentences synthesized so far, in order.
    pub fn sentences(&self) -> Vec<String> {
        self.sentences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

/// Decode a [`ScriptedTts`] frame payload into (sentence, frame) indices.
pub fn decode_tts_frame(pcm: &[u8]) -> Option<(usize, usize)> {
    if pcm.len() == 4 && pcm[2] == 0xAB && pcm[3] == 0xCD {
        Some((pcm[0] as usize, pcm[1] as usize))
    } else {
        None
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    async fn stream(&self, text: &str) -> Result<TtsStream> {
        if let Some(needle) = self
            .fail_containing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            && text.contains(needle)
        {
            return Err(OrchestratorError::TransientNetwork(
                "scripted TTS failure".into(),
            ));
        }

        let sentence = self.sentence_seq.fetch_add(1, Ordering::SeqCst);
        self.sentences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_owned());

        let frames = self.frames_per_sentence;
        let delay = self.frame_delay;
        Ok(Box::pin(async_stream::stream! {
            for frame in 0..frames {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(Bytes::from(vec![sentence as u8, frame as u8, 0xAB, 0xCD]));
            }
        }))
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Player ───────────────────────────────────────────────────────────

#[derive(Default)]
struct PlayerShared {
    played: Mutex<Vec<PcmChunk>>,
    starts: AtomicUsize,
    finishes: AtomicUsize,
    kills: AtomicUsize,
    fail_next_play: AtomicBool,
    notify: Mutex<Option<mpsc::UnboundedSender<usize>>>,
}

/// Player double that records every frame it is given.
#[derive(Clone, Default)]
pub struct RecordingPlayer {
    shared: Arc<PlayerShared>,
}

impl RecordingPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames played so far, in arrival order.
    pub fn played(&self) -> Vec<PcmChunk> {
        self.shared
            .played
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn finishes(&self) -> usize {
        self.shared.finishes.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }

    /// Fail the next `play` call (player crash scenario).
    pub fn fail_next_play(&self) {
        self.shared.fail_next_play.store(true, Ordering::SeqCst);
    }

    /// Receive the cumulative played-frame count after each frame.
    pub fn watch_playback(&self) -> mpsc::UnboundedReceiver<usize> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .shared
            .notify
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }
}

#[async_trait]
impl Player for RecordingPlayer {
    async fn start(&self) -> Result<()> {
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play(&self, pcm: PcmChunk) -> Result<()> {
        if self.shared.fail_next_play.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::Audio("scripted player crash".into()));
        }
        let count = {
            let mut played = self
                .shared
                .played
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            played.push(pcm);
            played.len()
        };
        let guard = self.shared.notify.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(count);
        }
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.shared.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Memory ───────────────────────────────────────────────────────────

/// Memory double: canned retrieval plus a record of extraction calls.
#[derive(Default)]
pub struct MockMemory {
    retrieved: Mutex<String>,
    extractions: Mutex<Vec<usize>>,
    fail_extract: AtomicBool,
}

impl MockMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_retrieved(text: &str) -> Arc<Self> {
        let memory = Self::default();
        *memory.retrieved.lock().unwrap_or_else(|e| e.into_inner()) = text.to_owned();
        Arc::new(memory)
    }

    pub fn fail_next_extract(&self) {
        self.fail_extract.store(true, Ordering::SeqCst);
    }

    /// Message-log lengths seen by `extract_and_save`, in call order.
    pub fn extractions(&self) -> Vec<usize> {
        self.extractions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Memory for MockMemory {
    async fn pre_load(&self, _query: &str) -> Result<String> {
        Ok(self
            .retrieved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn extract_and_save(&self, messages: &[Message]) -> Result<()> {
        if self.fail_extract.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::TransientNetwork(
                "scripted extraction failure".into(),
            ));
        }
        self.extractions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.len());
        Ok(())
    }
}

// ── Tools ────────────────────────────────────────────────────────────

/// Tool double returning a fixed value (or a scripted error).
pub struct FixedTool {
    name: String,
    output: serde_json::Value,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl FixedTool {
    pub fn new(name: &str, output: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            output,
            fail_with: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            output: serde_json::Value::Null,
            fail_with: Some(message.to_owned()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FixedTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            description: format!("test tool {}", self.name),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    async fn invoke(
        &self,
        _input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(message.clone()),
            None => Ok(self.output.clone()),
        }
    }
}

/// Shorthand for a scripted tool_use event.
pub fn tool_use_event(id: &str, name: &str) -> LlmEvent {
    LlmEvent::ToolUse(ToolUse {
        id: id.to_owned(),
        name: name.to_owned(),
        input: serde_json::json!({}),
    })
}
