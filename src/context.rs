//! Conversation context: message log, sliding window, system prompt assembly.
//!
//! The message log is append-only; readers get snapshots. The system prompt
//! is an ordered triple — persona, retrieved context, dynamic — and the
//! assembly method appends the dynamic block last unconditionally, so block
//! reordering (which would invalidate the prompt cache) is structurally
//! impossible.

use crate::messages::{Content, ContentBlock, Message, Role, SystemBlock};
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};

struct Inner {
    messages: Vec<Message>,
    retrieved: String,
}

/// Owns the conversation history and the system prompt inputs.
///
/// Single writer (the turn processor), multiple snapshot readers. Writes are
/// short; a plain mutex suffices.
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<Mutex<Inner>>,
    persona: Arc<str>,
    window_turns: usize,
}

impl ContextStore {
    /// Create a store with the static persona block and window size.
    pub fn new(persona: impl Into<Arc<str>>, window_turns: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                messages: Vec::new(),
                retrieved: String::new(),
            })),
            persona: persona.into(),
            window_turns: window_turns.max(1),
        }
    }

    /// Append a message. Messages are never mutated after this.
    pub fn append(&self, message: Message) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.messages.push(message);
    }

    /// Snapshot of the full log.
    pub fn log(&self) -> Vec<Message> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.messages.clone()
    }

    /// Number of messages appended so far.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replace the retrieved-context block. No reader ever
    /// observes a torn value.
    pub fn set_retrieved(&self, text: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.retrieved = text.into();
    }

    /// Sliding window of the last N turns, adjusted so the result is a
    /// well-formed conversation.
    ///
    /// A turn starts at a user message. When the boundary would separate a
    /// `tool_use` from its `tool_result`, the window extends backward to
    /// keep the pair; a leading `tool_result` with no matching `tool_use`
    /// in the window is dropped instead.
    pub fn window(&self) -> Vec<Message> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let messages = &inner.messages;

        let start = start_of_last_turns(messages, self.window_turns);
        let start = adjust_window_start(messages, start);
        messages[start..].to_vec()
    }

    /// Assemble the ordered 3-block system prompt for a request.
    ///
    /// Persona and retrieved context are cache-eligible; the dynamic block
    /// (wall-clock time, zone) is always last and never cacheable.
    pub fn system_blocks(&self) -> Vec<SystemBlock> {
        self.system_blocks_at(Local::now())
    }

    /// As [`Self::system_blocks`], with an injected clock for tests.
    pub fn system_blocks_at(&self, now: DateTime<Local>) -> Vec<SystemBlock> {
        let retrieved = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.retrieved.clone()
        };

        let mut blocks = Vec::with_capacity(3);
        blocks.push(SystemBlock {
            text: self.persona.to_string(),
            cache: true,
        });
        if !retrieved.is_empty() {
            blocks.push(SystemBlock {
                text: retrieved,
                cache: true,
            });
        }
        // Dynamic content always goes last: inserting it earlier would
        // invalidate the cache for every block after it.
        blocks.push(SystemBlock {
            text: format!(
                "Current time: {} ({})",
                now.format("%Y-%m-%d %H:%M:%S"),
                now.format("%Z%:z"),
            ),
            cache: false,
        });
        blocks
    }
}

/// Clamp retrieved context to a token budget, using the ~4 chars/token
/// heuristic. Cuts on a char boundary; close enough for a sizing knob.
pub fn clamp_to_token_budget(text: &str, target_tokens: usize) -> &str {
    let max_chars = target_tokens.saturating_mul(4);
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Move a window boundary so the windowed slice is well-formed.
///
/// A boundary landing on a `tool_result` extends backward when the matching
/// `tool_use` sits just before it, and otherwise steps forward past the
/// orphan.
fn adjust_window_start(messages: &[Message], mut start: usize) -> usize {
    loop {
        match messages.get(start) {
            Some(msg) if msg.role == Role::ToolResult => {
                if start > 0 && pair_matches(&messages[start - 1], msg) {
                    start -= 1;
                } else {
                    start += 1;
                }
            }
            _ => break,
        }
    }
    start
}

/// Index of the first message of the last `turns` user turns.
fn start_of_last_turns(messages: &[Message], turns: usize) -> usize {
    let mut seen = 0;
    for (idx, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::User {
            seen += 1;
            if seen == turns {
                return idx;
            }
        }
    }
    0
}

/// Whether `prev` carries a `tool_use` block matching the `tool_result` ids
/// in `result`.
fn pair_matches(prev: &Message, result: &Message) -> bool {
    let Content::Blocks(result_blocks) = &result.content else {
        return false;
    };
    let Content::Blocks(prev_blocks) = &prev.content else {
        return false;
    };
    result_blocks.iter().any(|rb| {
        let ContentBlock::ToolResult { id: result_id, .. } = rb else {
            return false;
        };
        prev_blocks.iter().any(
            |pb| matches!(pb, ContentBlock::ToolUse { id, .. } if id == result_id),
        )
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::messages::ToolUse;
    use serde_json::json;

    fn tool_turn(store: &ContextStore, n: u32) {
        store.append(Message::user(format!("question {n}")));
        store.append(Message::assistant_with_tools(
            "",
            &[ToolUse {
                id: format!("tu-{n}"),
                name: "get_time".into(),
                input: json!({}),
            }],
        ));
        store.append(Message::tool_result(&format!("tu-{n}"), json!("10:30"), false));
        store.append(Message::assistant(format!("answer {n}")));
    }

    // ── sliding window ───────────────────────────────────────────────

    #[test]
    fn window_keeps_last_n_turns() {
        let store = ContextStore::new("persona", 2);
        for n in 0..5 {
            store.append(Message::user(format!("u{n}")));
            store.append(Message::assistant(format!("a{n}")));
        }
        let window = store.window();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].content.text(), "u3");
        assert_eq!(window[3].content.text(), "a4");
    }

    #[test]
    fn window_smaller_log_returned_whole() {
        let store = ContextStore::new("persona", 10);
        store.append(Message::user("only"));
        assert_eq!(store.window().len(), 1);
    }

    #[test]
    fn window_keeps_tool_pairs_intact() {
        let store = ContextStore::new("persona", 1);
        tool_turn(&store, 1);
        tool_turn(&store, 2);

        let window = store.window();
        // Last turn: user, assistant(tool_use), tool_result, assistant.
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].role, Role::User);
        assert!(window[0].content.text().contains('2'));
        // Every tool_result in the window has its tool_use in the window.
        for (i, msg) in window.iter().enumerate() {
            if msg.role == Role::ToolResult {
                assert!(i > 0 && pair_matches(&window[i - 1], msg));
            }
        }
    }

    #[test]
    fn orphan_tool_result_at_leading_edge_dropped() {
        let store = ContextStore::new("persona", 1);
        // A tool_result with no preceding tool_use, then a normal turn.
        store.append(Message::tool_result("dangling", json!("x"), false));
        store.append(Message::user("hi"));
        store.append(Message::assistant("hello"));

        // Window counts back to the single user turn; nothing dangles.
        let window = store.window();
        assert_eq!(window[0].role, Role::User);
        assert!(window.iter().all(|m| m.role != Role::ToolResult));
    }

    #[test]
    fn boundary_inside_pair_extends_backward() {
        let messages = vec![
            Message::user("question"),
            Message::assistant_with_tools(
                "",
                &[ToolUse {
                    id: "tu-9".into(),
                    name: "lookup".into(),
                    input: json!({}),
                }],
            ),
            Message::tool_result("tu-9", json!("found"), false),
            Message::assistant("answer"),
        ];
        // A boundary landing on the tool_result pulls its tool_use back in.
        assert_eq!(adjust_window_start(&messages, 2), 1);
    }

    #[test]
    fn boundary_on_unmatched_tool_result_steps_forward() {
        let messages = vec![
            Message::assistant("no tools here"),
            Message::tool_result("tu-x", json!("stale"), false),
            Message::user("next"),
        ];
        assert_eq!(adjust_window_start(&messages, 1), 2);
    }

    // ── system prompt assembly ───────────────────────────────────────

    #[test]
    fn dynamic_block_is_always_last_and_uncached() {
        let store = ContextStore::new("You are a voice assistant.", 4);
        store.set_retrieved("User likes hiking.");

        let blocks = store.system_blocks();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].cache);
        assert_eq!(blocks[0].text, "You are a voice assistant.");
        assert!(blocks[1].cache);
        assert!(!blocks.last().unwrap().cache);
        assert!(blocks.last().unwrap().text.starts_with("Current time:"));
    }

    #[test]
    fn cacheable_blocks_stable_across_calls() {
        let store = ContextStore::new("persona text", 4);
        store.set_retrieved("retrieved text");

        let first = store.system_blocks();
        let second = store.system_blocks();
        // Persona and retrieved blocks are byte-identical between the two
        // calls that bracket a cacheable window; only dynamic may differ.
        assert_eq!(first[0], second[0]);
        assert_eq!(first[1], second[1]);
    }

    #[test]
    fn empty_retrieved_block_omitted() {
        let store = ContextStore::new("persona", 4);
        let blocks = store.system_blocks();
        assert_eq!(blocks.len(), 2);
        assert!(!blocks.last().unwrap().cache);
    }

    #[test]
    fn retrieved_update_is_atomic_swap() {
        let store = ContextStore::new("persona", 4);
        store.set_retrieved("first");
        store.set_retrieved("second");
        let blocks = store.system_blocks();
        assert_eq!(blocks[1].text, "second");
    }

    #[test]
    fn token_budget_clamps_by_chars() {
        let text = "가".repeat(100);
        let clamped = clamp_to_token_budget(&text, 10);
        assert_eq!(clamped.chars().count(), 40);
        assert_eq!(clamp_to_token_budget("short", 100), "short");
    }
}
