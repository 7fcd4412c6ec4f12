//! Terminal output decoding.
//!
//! PTY reads arrive in arbitrary byte chunks. [`OutputDecoder`] turns them into
//! UTF-8 text without splitting multi-byte characters and removes device
//! attribute reports, which terminals answer on their own and which would
//! otherwise be echoed back to the browser as garbage.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Primary and secondary device attribute reports: `ESC [ ? 1 ; 2 c`, `ESC [ > 0 ; 276 ; 0 c`.
static DEVICE_ATTRIBUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[?>]?[0-9;]*c").expect("device attribute pattern is valid")
});

/// A device attribute report cut off by the end of a read.
static PARTIAL_DEVICE_ATTRIBUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[?>]?[0-9;]*)?\z").expect("partial device attribute pattern is valid")
});

/// Removes device attribute reports from `text`.
pub fn strip_device_attributes(text: &str) -> Cow<'_, str> {
    DEVICE_ATTRIBUTES.replace_all(text, "")
}

/// Incremental UTF-8 decoder for PTY output.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes held back waiting for the rest of a
    /// character or escape sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feeds a chunk and returns the filtered text ready to emit, if any.
    ///
    /// An incomplete character, or a trailing `ESC [` sequence that could
    /// still become a device attribute report, is held back until the next
    /// call. Invalid sequences become U+FFFD.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let mut pending = Vec::new();
        if let Some(partial) = PARTIAL_DEVICE_ATTRIBUTES.find(&text) {
            pending.extend_from_slice(partial.as_str().as_bytes());
            text.truncate(partial.start());
        }
        pending.extend_from_slice(rest);
        self.pending = pending;
        filtered(text)
    }

    /// Flushes whatever is still held back. Used once the PTY reaches EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        filtered(text)
    }
}

fn filtered(text: String) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let text = match strip_device_attributes(&text) {
        Cow::Borrowed(_) => text,
        Cow::Owned(stripped) => stripped,
    };
    (!text.is_empty()).then_some(text)
}
