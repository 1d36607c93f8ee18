//! Stream buffer configuration.

/// Default read-buffer cap: 100 MiB.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// Default size of a single recv chunk: 4 KiB.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Per-stream buffer limits.
///
/// A stream whose read buffer reaches `max_buffer_size` is closed; until
/// then the cap is what turns kernel-side TCP flow control into
/// backpressure on the peer.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Upper bound on buffered inbound bytes before the stream closes.
    pub max_buffer_size: usize,
    /// How many bytes a single recv attempt pulls off the socket.
    pub read_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn with_max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    #[must_use]
    pub fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }
}
