//! UTF-8 aware fragment streaming.
//!
//! A token's text can end halfway through a multi-byte character. The
//! [`Streamer`] buffers raw token bytes and only releases text up to the last
//! complete code point, so a streaming callback never sees a split character.

use tracing::trace;

/// Buffers detokenized bytes and yields complete UTF-8 text.
#[derive(Debug, Default)]
pub struct Streamer {
    pending: Vec<u8>,
}

impl Streamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token's bytes. Returns the text that is now complete, if any.
    ///
    /// Byte sequences that can never become valid UTF-8 are replaced with
    /// U+FFFD instead of stalling the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            trace!("Replacing {bad} invalid byte(s) in token stream");
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete trailing sequence: wait for more bytes.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        (!out.is_empty()).then_some(out)
    }

    /// Flush whatever is buffered, replacing an incomplete trailing
    /// sequence with U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
