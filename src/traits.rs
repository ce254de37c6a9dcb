//! Collaborator contracts.
//!
//! Every external component — VAD, STT, LLM, TTS, the speaker sink, and the
//! memory store — is referenced only through these traits. Concrete
//! implementations are bound once at startup, so the pipeline is testable
//! against scripted doubles and protocol clients stay swappable.

use crate::error::Result;
use crate::messages::{LlmEvent, Message, MicFrame, PcmChunk, SttEvent, SystemBlock, ToolDef};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Voice activity detection over microphone frames.
///
/// Called synchronously from the microphone thread, so implementations must
/// not block or await. Stateful: speech-start fires only after a sustained
/// supra-threshold run and speech-end only after a sustained sub-threshold
/// run (hysteresis).
pub trait Vad: Send {
    /// Classify one frame against the given threshold.
    fn is_speech(&mut self, frame: &MicFrame, threshold: f32) -> bool;

    /// Clear hysteresis state (e.g. after a barge-in teardown).
    fn reset(&mut self);
}

/// Streaming speech-to-text session.
///
/// The connection is persistent across utterances; callers reconnect on send
/// failure. Events arrive on the channel returned by `connect`.
#[async_trait]
pub trait SpeechToText: Send {
    /// Open (or reopen) the session and return its event stream.
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<SttEvent>>;

    /// Forward one microphone frame to the recognizer.
    async fn send_frame(&mut self, frame: &MicFrame) -> Result<()>;

    /// Close the session.
    async fn disconnect(&mut self) -> Result<()>;
}

/// A lazy, ordered stream of LLM events.
pub type LlmStream = BoxStream<'static, Result<LlmEvent>>;

/// Streaming, tool-capable language model.
///
/// One active stream at a time; restartable across turns.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Open a response stream for the given prompt assembly.
    ///
    /// `system` is the ordered block triple; the cacheability marker on each
    /// block is honored by the protocol client.
    async fn stream(
        &self,
        system: &[SystemBlock],
        tools: &[ToolDef],
        messages: &[Message],
    ) -> Result<LlmStream>;

    /// Terminate the active stream at its next await point.
    fn cancel(&self);
}

/// A lazy, ordered stream of synthesized PCM chunks.
pub type TtsStream = BoxStream<'static, Result<PcmChunk>>;

/// Streaming text-to-speech. Streams are independent per sentence.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one sentence as a PCM stream.
    async fn stream(&self, text: &str) -> Result<TtsStream>;

    /// Cancel the active stream (barge-in).
    async fn flush(&self);
}

/// Speaker sink over an OS audio output.
#[async_trait]
pub trait Player: Send + Sync {
    /// Bring up the sink (idempotent).
    async fn start(&self) -> Result<()>;

    /// Queue one PCM chunk for playback.
    async fn play(&self, pcm: PcmChunk) -> Result<()>;

    /// Close the input and wait for queued audio to drain.
    async fn finish(&self) -> Result<()>;

    /// Stop immediately, discarding queued audio.
    async fn kill(&self);
}

/// Persistent memory / retrieval store. Failures are non-fatal: a turn
/// proceeds without retrieved context, extraction errors are logged.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Retrieve context relevant to the query for the system prompt.
    async fn pre_load(&self, query: &str) -> Result<String>;

    /// Extract durable facts from the conversation and persist them.
    async fn extract_and_save(&self, messages: &[Message]) -> Result<()>;
}

/// Memory implementation that stores nothing. Used when no store is bound.
pub struct NullMemory;

#[async_trait]
impl Memory for NullMemory {
    async fn pre_load(&self, _query: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn extract_and_save(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }
}

/// An executable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Definition advertised in the LLM request.
    fn definition(&self) -> ToolDef;

    /// Execute with the model-provided input. `Err` carries a message that
    /// is returned to the model as an error tool result.
    async fn invoke(
        &self,
        input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String>;
}

/// The set of tools offered to the model, looked up by name.
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.definition().name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDef {
            ToolDef {
                name: "echo".into(),
                description: "Echo the input back".into(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn invoke(
            &self,
            input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, String> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn tool_set_lookup_and_invoke() {
        let mut tools = ToolSet::new();
        tools.register(Arc::new(EchoTool));
        assert_eq!(tools.definitions().len(), 1);

        let tool = tools.get("echo").unwrap();
        let out = tool.invoke(json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert!(tools.get("missing").is_none());
    }

    #[tokio::test]
    async fn null_memory_is_silent() {
        let memory = NullMemory;
        assert_eq!(memory.pre_load("anything").await.unwrap(), "");
        memory.extract_and_save(&[]).await.unwrap();
    }
}
