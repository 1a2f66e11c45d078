//! Adaptive chunk sizing for the payload stream.
//!
//! A chunk is the unit the sender reads from disk and hands to the writer
//! queue. Fast drains grow it, slow drains shrink it.

use std::time::Duration;

/// Starting and minimum chunk size.
pub const MIN_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB
/// Largest chunk the sender will read at once.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// A chunk drained faster than this doubles the size.
pub const GROW_BELOW: Duration = Duration::from_millis(25);
/// A chunk drained slower than this halves the size.
pub const SHRINK_ABOVE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ChunkSizer {
    current: usize,
}

impl ChunkSizer {
    pub fn new() -> Self {
        Self {
            current: MIN_CHUNK_SIZE,
        }
    }

    /// Size of the next chunk to read.
    pub fn next_size(&self) -> usize {
        self.current
    }

    /// Feed back how long the last chunk of `bytes` took to drain.
    /// Short tail chunks are ignored so the end of a file does not skew the size.
    pub fn record(&mut self, bytes: usize, elapsed: Duration) {
        if bytes < self.current {
            return;
        }
        if elapsed < GROW_BELOW {
            self.current = (self.current * 2).min(MAX_CHUNK_SIZE);
        } else if elapsed > SHRINK_ABOVE {
            self.current = (self.current / 2).max(MIN_CHUNK_SIZE);
        }
    }
}

impl Default for ChunkSizer {
    fn default() -> Self {
        Self::new()
    }
}
