//! Bounded trailing window over terminal output.
//!
//! Output is kept as a queue of chunks with a running character count. When
//! an append pushes the count over the limit, whole chunks are dropped from
//! the front and the new front chunk is cut at a character boundary, so the
//! window never holds more than `limit` characters and is never rebuilt from
//! one ever-growing string.

use std::collections::VecDeque;

/// Default number of trailing characters retained (40,000).
pub const DEFAULT_OUTPUT_LIMIT: usize = 40_000;

#[derive(Debug, Clone)]
struct Chunk {
    text: String,
    chars: usize,
}

/// Trailing window of at most `limit` characters.
#[derive(Debug, Clone)]
pub struct OutputWindow {
    chunks: VecDeque<Chunk>,
    chars: usize,
    bytes: usize,
    limit: usize,
}

impl Default for OutputWindow {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT)
    }
}

impl OutputWindow {
    /// Creates an empty window retaining at most `limit` characters.
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            chars: 0,
            bytes: 0,
            limit,
        }
    }

    /// The character limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of characters currently held.
    pub fn len_chars(&self) -> usize {
        self.chars
    }

    /// Whether the window holds no output.
    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    /// Appends a chunk, dropping the oldest characters beyond the limit.
    pub fn append(&mut self, data: &str) {
        if data.is_empty() || self.limit == 0 {
            return;
        }

        let count = data.chars().count();
        if count >= self.limit {
            self.clear();
            let tail = trim_to_trailing(data, self.limit);
            self.bytes = tail.len();
            self.chars = self.limit;
            self.chunks.push_back(Chunk {
                text: tail.to_string(),
                chars: self.limit,
            });
            return;
        }

        self.chunks.push_back(Chunk {
            text: data.to_string(),
            chars: count,
        });
        self.chars += count;
        self.bytes += data.len();

        while self.chars > self.limit {
            let excess = self.chars - self.limit;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.chars <= excess {
                self.chars -= front.chars;
                self.bytes -= front.text.len();
                self.chunks.pop_front();
            } else {
                let cut = byte_offset_of_char(&front.text, excess);
                front.text.drain(..cut);
                front.chars -= excess;
                self.chars -= excess;
                self.bytes -= cut;
            }
        }
    }

    /// Returns the contents without clearing.
    pub fn contents(&self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.push_str(&chunk.text);
        }
        out
    }

    /// Returns the contents and empties the window.
    pub fn take(&mut self) -> String {
        let out = self.contents();
        self.clear();
        out
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.chars = 0;
        self.bytes = 0;
    }
}

/// Byte offset of the `n`th character of `s` (or `s.len()`).
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// The last `limit` characters of `s`.
pub fn trim_to_trailing(s: &str, limit: usize) -> &str {
    let count = s.chars().count();
    if count <= limit {
        return s;
    }
    &s[byte_offset_of_char(s, count - limit)..]
}
