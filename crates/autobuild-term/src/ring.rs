//! Bounded output ring for terminal replay.
//!
//! Each terminal retains at most [`MAX_BYTES`] of output and at most
//! [`MAX_CHUNKS`] chunks, whichever bound bites first. The oldest chunks are
//! evicted. Late subscribers replay the ring once via `get-buffer` and then
//! follow live output.

use std::collections::VecDeque;

/// Byte budget per terminal.
pub const MAX_BYTES: usize = 100 * 1024;
/// Chunk budget per terminal.
pub const MAX_CHUNKS: usize = 1000;

/// FIFO of output chunks with byte and chunk bounds.
#[derive(Debug, Default)]
pub struct OutputRing {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
}

impl OutputRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, evicting from the front until both bounds hold.
    /// A single chunk larger than the byte budget is trimmed to its tail.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let chunk = if chunk.len() > MAX_BYTES {
            chunk[chunk.len() - MAX_BYTES..].to_vec()
        } else {
            chunk.to_vec()
        };

        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.total_bytes > MAX_BYTES || self.chunks.len() > MAX_CHUNKS {
            match self.chunks.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    /// Total retained bytes.
    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenated retained output, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
