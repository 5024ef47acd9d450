//! Append/advance byte buffer backing node value queues.

/// A byte buffer that supports cheap front consumption.
///
/// Consumers advance a virtual front offset instead of shifting bytes;
/// the storage is compacted once the dead prefix grows past
/// [`SlidingBuffer::COMPACT_THRESHOLD`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlidingBuffer {
    data: Vec<u8>,
    virtual_front: usize,
}

impl SlidingBuffer {
    /// Don't compact while the consumed prefix is below this size; the
    /// memmove would cost more than the memory it reclaims.
    pub const COMPACT_THRESHOLD: usize = 64;

    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live bytes, starting at the virtual front.
    pub fn data(&self) -> &[u8] {
        &self.data[self.virtual_front..]
    }

    /// Number of live bytes.
    pub fn size(&self) -> usize {
        self.data.len() - self.virtual_front
    }

    /// Total bytes held, including the consumed prefix.
    pub fn raw_size(&self) -> usize {
        self.data.len()
    }

    /// True when no live bytes remain.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current virtual front offset into the raw storage.
    pub fn virtual_front(&self) -> usize {
        self.virtual_front
    }

    /// Append bytes to the back of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Consume `count` bytes from the front.
    ///
    /// Advancing past the end clamps to the end.
    pub fn advance(&mut self, count: usize) {
        self.virtual_front = (self.virtual_front + count).min(self.data.len());
        if self.virtual_front >= Self::COMPACT_THRESHOLD {
            self.compact();
        }
    }

    /// Replace the buffer contents with raw storage plus a front offset.
    pub fn assign_raw(&mut self, bytes: Vec<u8>, front_offset: usize) {
        self.virtual_front = front_offset.min(bytes.len());
        self.data = bytes;
    }

    fn compact(&mut self) {
        self.data.drain(..self.virtual_front);
        self.virtual_front = 0;
    }
}
