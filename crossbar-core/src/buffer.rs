use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Ordered queue of inbound byte chunks with a running total.
///
/// Backs the stream read buffer: recv chunks are pushed as-is and
/// `consume` splices out exactly `n` bytes, leaving any surplus of the
/// last chunk at the front for the next read. Extraction that stays
/// within one chunk is zero-copy (a refcount bump on the `Bytes`);
/// spanning chunks costs one copy into a fresh contiguous buffer.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    /// Total buffered bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one recv chunk. Empty chunks are dropped.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Splice out exactly `n` bytes from the front.
    ///
    /// Returns `None` when fewer than `n` bytes are buffered; the buffer
    /// is left untouched in that case.
    pub fn consume(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.len {
            return None;
        }

        let mut head = self.chunks.pop_front()?;

        // Fast path: the first chunk covers the request. Split it and
        // push the surplus back to the front.
        if head.len() >= n {
            let out = head.split_to(n);
            if !head.is_empty() {
                self.chunks.push_front(head);
            }
            self.len -= n;
            return Some(out);
        }

        // Spanning path: accumulate whole chunks, then split the last one.
        let mut out = BytesMut::with_capacity(n);
        out.extend_from_slice(&head);
        let mut have = head.len();
        while have < n {
            let mut chunk = self
                .chunks
                .pop_front()
                .expect("running total covers the request");
            let take = (n - have).min(chunk.len());
            out.extend_from_slice(&chunk.split_to(take));
            have += take;
            if !chunk.is_empty() {
                self.chunks.push_front(chunk);
            }
        }
        self.len -= n;
        Some(out.freeze())
    }
}
