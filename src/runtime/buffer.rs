//! Per-connection circular buffers and the per-worker pool that recycles
//! their storage.
//!
//! Each connection owns one receive and one send `CircularBuffer`. Bytes are
//! appended at the tail and consumed from the head; once the tail wraps, the
//! held bytes are exposed as two segments which the ring views in
//! `crate::wire::ring` stitch back together without copying.
//!
//! Storage is fixed at allocation time. Nothing here grows: a full buffer is
//! the caller's problem to report.

use crate::wire::{RingReader, RingWriter};

/// Fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct CircularBuffer {
    storage: Box<[u8]>,
    /// Index of the first held byte.
    head: usize,
    /// Number of held bytes.
    len: usize,
}

impl CircularBuffer {
    /// Create an empty buffer over freshly zeroed storage.
    pub fn new(capacity: usize) -> Self {
        Self::with_storage(vec![0u8; capacity].into_boxed_slice())
    }

    /// Create an empty buffer over recycled storage.
    pub fn with_storage(storage: Box<[u8]>) -> Self {
        Self {
            storage,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of held bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.storage.len()
    }

    /// Free space in bytes.
    pub fn available(&self) -> usize {
        self.storage.len() - self.len
    }

    /// Held bytes in logical order as up to two slices.
    pub fn segments(&self) -> (&[u8], &[u8]) {
        let empty: &[u8] = &[];
        let cap = self.storage.len();
        if self.head + self.len <= cap {
            (&self.storage[self.head..self.head + self.len], empty)
        } else {
            let first = cap - self.head;
            (&self.storage[self.head..], &self.storage[..self.len - first])
        }
    }

    /// Reader over the held bytes.
    pub fn reader(&self) -> RingReader<'_> {
        let (first, second) = self.segments();
        RingReader::new(first, second)
    }

    /// Free space in write order as up to two mutable slices.
    pub fn free_segments_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let cap = self.storage.len();
        let head = self.head;
        if self.len == cap {
            let (none, rest) = self.storage.split_at_mut(0);
            return (none, &mut rest[..0]);
        }

        let tail = (head + self.len) % cap;
        if tail >= head {
            // Held bytes (if any) sit in [head, tail); free space is the end
            // of the allocation followed by its start.
            let (start, end) = self.storage.split_at_mut(tail);
            (end, &mut start[..head])
        } else {
            let (gap, rest) = self.storage[tail..head].split_at_mut(head - tail);
            (gap, rest)
        }
    }

    /// Writer over the free space. Call [`commit`](Self::commit) with the
    /// bytes written to make them part of the held data.
    pub fn writer(&mut self) -> RingWriter<'_> {
        let (first, second) = self.free_segments_mut();
        RingWriter::new(first, second)
    }

    /// Mark `n` bytes of free space as held.
    ///
    /// # Panics
    /// Panics if `n` exceeds the free space.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.available(), "commit past buffer capacity");
        self.len += n;
    }

    /// Drop `n` held bytes from the head.
    ///
    /// # Panics
    /// Panics if `n` exceeds the held bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consume past held bytes");
        self.len -= n;
        if self.len == 0 {
            // Keep the next write contiguous
            self.head = 0;
        } else {
            self.head = (self.head + n) % self.storage.len();
        }
    }

    /// Append `data` at the tail. Returns false, leaving the buffer
    /// unchanged, if it does not fit.
    pub fn push(&mut self, data: &[u8]) -> bool {
        let mut writer = self.writer();
        if writer.write_bytes(data).is_err() {
            return false;
        }
        self.commit(data.len());
        true
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Give the storage back, e.g. to a [`BufferPool`].
    pub fn into_storage(self) -> Box<[u8]> {
        self.storage
    }
}

/// Per-worker pool of fixed-size buffer storage.
///
/// Allocations are made once up front and recycled as connections come and
/// go, so accepting a connection does not hit the allocator after warm-up.
pub struct BufferPool {
    /// Storage not currently owned by a connection.
    free_list: Vec<Box<[u8]>>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Total buffers this pool will hand out.
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let free_list = (0..count)
            .map(|_| vec![0u8; size].into_boxed_slice())
            .collect();

        Self {
            free_list,
            buffer_size: size,
            capacity: count,
        }
    }

    /// Take an empty circular buffer from the pool.
    ///
    /// Returns `None` if no buffers are available.
    pub fn alloc(&mut self) -> Option<CircularBuffer> {
        self.free_list.pop().map(CircularBuffer::with_storage)
    }

    /// Return a buffer's storage to the pool.
    pub fn free(&mut self, buffer: CircularBuffer) {
        let storage = buffer.into_storage();
        debug_assert_eq!(storage.len(), self.buffer_size, "foreign buffer returned");
        if self.free_list.len() < self.capacity {
            self.free_list.push(storage);
        }
    }

    /// Get the number of available buffers.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}
