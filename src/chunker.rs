//! Sentence chunking for streaming TTS cutover.
//!
//! Accumulates LLM text deltas and yields completed sentences as soon as a
//! terminator appears, so synthesis of sentence N starts while the model is
//! still emitting sentence N+1. The trailing fragment stays buffered until
//! the next terminator or end of stream.

/// Characters that end a sentence when followed by whitespace or the end of
/// the buffer. `~` covers common Korean sentence endings.
const TERMINATORS: [char; 4] = ['.', '!', '?', '~'];

/// Default cap on the buffered remainder, in characters.
///
/// A model emitting long output without any terminator would otherwise grow
/// the buffer without bound; past the cap the whole remainder is flushed as
/// one sentence.
pub const DEFAULT_MAX_BUFFER_CHARS: usize = 2000;

/// Splits a growing text stream into completed sentences.
///
/// Ellipses split at their last `.` only, since an inner dot is never
/// followed by whitespace. Decimal numbers and URLs may split incorrectly in
/// rare cases, which is acceptable for voice output.
#[derive(Debug)]
pub struct SentenceChunker {
    buffer: String,
    max_buffer_chars: usize,
}

impl Default for SentenceChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl SentenceChunker {
    /// Create a chunker with the default remainder cap.
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER_CHARS)
    }

    /// Create a chunker with a custom remainder cap.
    pub fn with_max_buffer(max_buffer_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffer_chars: max_buffer_chars.max(1),
        }
    }

    /// Append a text delta and return any sentences completed by it.
    ///
    /// Whitespace-only sentences are discarded. When the buffered remainder
    /// exceeds the cap it is flushed as a single sentence.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut completed = Vec::new();
        while let Some(end) = find_sentence_end(&self.buffer) {
            let sentence = self.buffer[..end].trim();
            if !sentence.is_empty() {
                completed.push(sentence.to_owned());
            }
            // Drop the sentence and the separating whitespace in one splice.
            let rest_start = self.buffer[end..]
                .char_indices()
                .find(|(_, c)| !c.is_whitespace())
                .map_or(self.buffer.len(), |(i, _)| end + i);
            self.buffer.drain(..rest_start);
        }

        if self.buffer.chars().count() > self.max_buffer_chars {
            let flushed = std::mem::take(&mut self.buffer);
            let flushed = flushed.trim();
            if !flushed.is_empty() {
                completed.push(flushed.to_owned());
            }
        }

        completed
    }

    /// The trailing fragment after the last terminator.
    pub fn remainder(&self) -> &str {
        &self.buffer
    }

    /// Flush the remainder at end of stream, if it holds any text.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        }
    }

    /// Drop any buffered text (barge-in discard path).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Byte offset one past the first sentence terminator, or `None`.
///
/// A terminator only counts when the following character is whitespace or
/// the buffer ends there, so `3.14` stays whole and `...` splits after its
/// final dot.
fn find_sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if !TERMINATORS.contains(&c) {
            continue;
        }
        match chars.peek() {
            Some((_, next)) if next.is_whitespace() => {
                return Some(idx + c.len_utf8());
            }
            Some(_) => {}
            None => return Some(idx + c.len_utf8()),
        }
    }
    None
}
