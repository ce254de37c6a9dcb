//! Message and event types passed between pipeline stages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A chunk of raw audio samples from the microphone.
#[derive(Debug, Clone)]
pub struct MicFrame {
    /// Mono f32 samples at the configured input sample rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic capture timestamp; orders barge-in against turn completion.
    pub captured_at: Instant,
}

/// Kind of a transcript event from STT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    /// May be superseded by later events.
    Partial,
    /// Committed; triggers utterance-end handling.
    Final,
}

/// A transcript event from the STT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
}

/// Events emitted by an STT session.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// The remote session is up and accepting frames.
    SessionStarted,
    /// A partial or committed transcript.
    Transcript(TranscriptEvent),
    /// The remote endpointer decided the utterance is over.
    UtteranceEnd,
    /// Session-level failure; the connection should be reset.
    Error(String),
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A structured block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: serde_json::Value,
        is_error: bool,
    },
}

/// Message content: plain text or a block sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    /// Whether any block is a `tool_use`.
    pub fn has_tool_use(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. })),
        }
    }
}

/// One entry in the append-only conversation log. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    pub ts: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
            ts: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
            ts: Utc::now(),
        }
    }

    /// Assistant message carrying the text (if any) plus tool_use blocks.
    pub fn assistant_with_tools(text: &str, tool_uses: &[ToolUse]) -> Self {
        let mut blocks = Vec::with_capacity(tool_uses.len() + 1);
        if !text.trim().is_empty() {
            blocks.push(ContentBlock::Text {
                text: text.to_owned(),
            });
        }
        for tu in tool_uses {
            blocks.push(ContentBlock::ToolUse {
                id: tu.id.clone(),
                name: tu.name.clone(),
                input: tu.input.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content: Content::Blocks(blocks),
            ts: Utc::now(),
        }
    }

    /// Tool result message for a single invocation.
    pub fn tool_result(id: &str, output: serde_json::Value, is_error: bool) -> Self {
        Self {
            role: Role::ToolResult,
            content: Content::Blocks(vec![ContentBlock::ToolResult {
                id: id.to_owned(),
                output,
                is_error,
            }]),
            ts: Utc::now(),
        }
    }
}

/// One ordered block of the system prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemBlock {
    pub text: String,
    /// Whether the block is prompt-cache eligible. The dynamic block never is.
    pub cache: bool,
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A single event from the LLM stream.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A fragment of assistant text.
    TextDelta(String),
    /// A complete tool invocation request emitted mid-stream.
    ToolUse(ToolUse),
    /// End of the response.
    Stop,
}

/// Synthesized PCM from TTS (i16 little-endian mono bytes).
pub type PcmChunk = Bytes;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    #[test]
    fn content_text_joins_text_blocks() {
        let content = Content::Blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "get_time".into(),
                input: json!({}),
            },
            ContentBlock::Text { text: "b".into() },
        ]);
        assert_eq!(content.text(), "ab");
        assert!(content.has_tool_use());
    }

    #[test]
    fn assistant_with_tools_skips_empty_text() {
        let msg = Message::assistant_with_tools(
            "  ",
            &[ToolUse {
                id: "t1".into(),
                name: "get_time".into(),
                input: json!({}),
            }],
        );
        match &msg.content {
            Content::Blocks(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert!(matches!(blocks[0], ContentBlock::ToolUse { .. }));
            }
            Content::Text(_) => panic!("expected blocks"),
        }
    }

    #[test]
    fn tool_result_round_trips_json() {
        let msg = Message::tool_result("t1", json!("10:30"), false);
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
