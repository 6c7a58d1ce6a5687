//! JSON text framing and permissive UTF-8 decoding of terminal output.

use crate::error::{DeckError, DeckResult};

/// Encode a frame as a JSON text message.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> DeckResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text message into a typed frame.
pub fn decode_frame<T: serde::de::DeserializeOwned>(text: &str) -> DeckResult<T> {
    serde_json::from_str(text).map_err(|e| DeckError::InvalidMessage(e.to_string()))
}

/// Streaming UTF-8 decoder for PTY output.
///
/// PTY reads cut the byte stream at arbitrary points, so a multi-byte
/// character may straddle two chunks. The trailing incomplete sequence is held
/// back until the next chunk; bytes that can never form valid UTF-8 become
/// U+FFFD. Decoding never fails.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Decode the next chunk, returning all text that is complete so far.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;
        out
    }

    /// Flush whatever is still buffered (end of stream).
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
