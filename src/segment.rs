//! Incremental sentence segmentation of streamed text
//!
//! Re-assembles the delta stream into complete sentence units so synthesis of
//! sentence one can start before generation has finished sentence three. A
//! unit ends at a sentence terminator (`.` `!` `?` or newline) followed by
//! whitespace; the unterminated tail is carried across calls until the stream
//! ends.

/// Sentence terminator characters
const TERMINATORS: [char; 4] = ['.', '!', '?', '\n'];

/// Stateful splitter over an incremental chunk stream
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    carry: String,
}

impl SentenceSegmenter {
    /// Create an empty segmenter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete sentence unit it closed,
    /// trimmed, in arrival order
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.carry.push_str(chunk);

        let mut units = Vec::new();
        let mut start = 0usize;
        let mut chars = self.carry.char_indices().peekable();

        while let Some((idx, c)) = chars.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            // a boundary needs whitespace after the terminator; end-of-carry
            // stays in the tail until more text or a flush arrives
            let Some(&(_, next)) = chars.peek() else {
                break;
            };
            if !next.is_whitespace() {
                continue;
            }

            let unit = self.carry[start..=idx].trim();
            if !unit.is_empty() {
                units.push(unit.to_string());
            }

            // consume the whole whitespace run
            start = idx + c.len_utf8();
            while let Some(&(ws_idx, ws)) = chars.peek() {
                if ws.is_whitespace() {
                    start = ws_idx + ws.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if start > 0 {
            self.carry.drain(..start);
        }
        units
    }

    /// End of stream: take the remaining tail as a final unit, if any
    pub fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.carry);
        let tail = tail.trim();
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_string())
        }
    }
}
