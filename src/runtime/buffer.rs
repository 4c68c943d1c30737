//! Fixed-capacity receive buffer with explicit cursors.
//!
//! The buffer never grows. Valid bytes live in `[0, filled)`, and the prefix
//! `[0, consumed)` has already been handed to the parser, so
//! `consumed <= filled <= capacity` holds at all times. All offset arithmetic
//! stays behind this type; callers only see slices.

/// Receive buffer owned by a single connection.
pub struct RecvBuffer {
    data: Box<[u8]>,
    filled: usize,
    consumed: usize,
}

impl RecvBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            consumed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently valid in the buffer.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Prefix of the valid bytes already handed out.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// No room left at the tail.
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Valid bytes not yet consumed.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.consumed..self.filled]
    }

    /// Mark `n` unconsumed bytes as consumed.
    ///
    /// # Panics
    /// Panics if fewer than `n` bytes are unconsumed.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.filled - self.consumed, "consume past filled");
        self.consumed += n;
    }

    /// Writable tail region for the next receive.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record that `n` bytes were written into [`spare_mut`](Self::spare_mut).
    ///
    /// # Panics
    /// Panics if `n` exceeds the spare capacity.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.data.len() - self.filled, "commit past capacity");
        self.filled += n;
    }

    /// Drop everything, valid or not.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.consumed = 0;
    }

    /// Move the unconsumed bytes to the front of the buffer.
    pub fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.data.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }

    /// Copy up to `dst.len()` unconsumed bytes into `dst`, consume them and
    /// compact. Returns the number of bytes copied.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.filled - self.consumed);
        dst[..n].copy_from_slice(&self.data[self.consumed..self.consumed + n]);
        self.consumed += n;
        self.compact();
        n
    }
}
