//! Frame codec for the gateway byte stream
//!
//! Text encoding is one JSON object per frame, NUL-terminated (newline
//! terminators are tolerated). Binary DTC frames carry a 2-byte
//! little-endian length prefix; they are detected during the handshake
//! and rejected, not decoded.

use serde_json::Value;
use tracing::{debug, warn};

/// Upper bound on a single frame; anything larger means a corrupt stream
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Wire encoding detected from the first inbound bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEncoding {
    Text,
    Binary,
    /// Not enough bytes seen yet
    Undetermined,
}

/// Incremental decoder for terminator-delimited JSON frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    /// Frames dropped because they were not valid JSON
    malformed_count: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify the encoding from the first bytes of the stream.
    ///
    /// A text peer opens with a JSON object; a binary peer's first two
    /// bytes are a little-endian frame size that matches a plausible
    /// logon response length.
    pub fn detect_encoding(first_bytes: &[u8]) -> WireEncoding {
        let Some(&first) = first_bytes.iter().find(|b| !b.is_ascii_whitespace()) else {
            return WireEncoding::Undetermined;
        };
        if first == b'{' {
            return WireEncoding::Text;
        }
        if first_bytes.len() >= 4 {
            let size = u16::from_le_bytes([first_bytes[0], first_bytes[1]]) as usize;
            if size > 0 && size < 4096 {
                return WireEncoding::Binary;
            }
        }
        WireEncoding::Undetermined
    }

    /// Encode one JSON value as an outbound frame
    pub fn encode(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(0);
        Ok(bytes)
    }

    /// Feed raw bytes from the socket into the decode buffer
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if any.
    ///
    /// Malformed JSON inside a complete frame is logged and skipped; the
    /// decode loop never aborts on bad input.
    pub fn next_frame(&mut self) -> Option<Value> {
        loop {
            let end = self
                .buffer
                .iter()
                .position(|&b| b == 0 || b == b'\n')?;

            let frame: Vec<u8> = self.buffer.drain(..=end).take(end).collect();
            let trimmed: &[u8] = {
                let start = frame.iter().position(|b| !b.is_ascii_whitespace());
                match start {
                    Some(s) => &frame[s..],
                    None => &[],
                }
            };

            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Value>(trimmed) {
                Ok(value) => return Some(value),
                Err(e) => {
                    self.malformed_count += 1;
                    warn!(
                        "Skipping malformed frame ({} bytes): {}",
                        trimmed.len(),
                        e
                    );
                    continue;
                }
            }
        }
    }

    /// True when the buffer has outgrown any legitimate frame
    pub fn is_overflowing(&self) -> bool {
        if self.buffer.len() > MAX_FRAME_BYTES {
            debug!("Frame buffer at {} bytes without a terminator", self.buffer.len());
            true
        } else {
            false
        }
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
