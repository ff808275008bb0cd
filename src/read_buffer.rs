//! Fixed-capacity circular buffer holding a session's inbound stream bytes.

/// Byte ring of capacity `N`. Writes never grow the buffer; callers check
/// [`ReadBuffer::available_size`] (or the return value) instead.
pub struct ReadBuffer<const N: usize> {
    data: [u8; N],
    /// Index of the next byte to read
    back: usize,
    /// Number of buffered bytes
    size: usize,
}

impl<const N: usize> ReadBuffer<N> {
    pub const fn new() -> Self {
        Self {
            data: [0; N],
            back: 0,
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available_size(&self) -> usize {
        N - self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn clear(&mut self) {
        self.back = 0;
        self.size = 0;
    }

    /// Next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        Some(self.data[self.back])
    }

    pub fn pop(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.back = (self.back + 1) % N;
        self.size -= 1;
        Some(byte)
    }

    /// Discard `count` bytes. Fails without touching the buffer if fewer are buffered.
    #[must_use]
    pub fn advance(&mut self, count: usize) -> bool {
        if count > self.size {
            return false;
        }
        if self.size == count {
            self.clear();
            return true;
        }
        self.back = (self.back + count) % N;
        self.size -= count;
        true
    }

    /// Copy `out.len()` bytes out of the buffer, consuming them.
    #[must_use]
    pub fn read_into(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.size {
            return false;
        }
        for byte in out.iter_mut() {
            *byte = self.data[self.back];
            self.back = (self.back + 1) % N;
        }
        self.size -= out.len();
        true
    }

    /// Append all of `bytes`, or nothing if they do not fit.
    #[must_use]
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available_size() {
            return false;
        }
        let mut front = (self.back + self.size) % N;
        for &byte in bytes {
            self.data[front] = byte;
            front = (front + 1) % N;
        }
        self.size += bytes.len();
        true
    }
}

impl<const N: usize> Default for ReadBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
