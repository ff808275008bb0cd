//! Fixed-capacity linear buffer holding a session's queued outbound bytes.
//!
//! Replies are appended whole and drained from the front in whatever chunk the
//! transport window allows, so the remainder is shifted down after each send.

pub struct WriteBuffer<const N: usize> {
    data: [u8; N],
    pos: usize,
}

impl<const N: usize> WriteBuffer<N> {
    pub const fn new() -> Self {
        Self { data: [0; N], pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn available_size(&self) -> usize {
        N - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn clear(&mut self) {
        self.pos = 0;
    }

    /// The occupied prefix, ready to hand to the transport
    pub fn data(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    #[must_use]
    pub fn push(&mut self, byte: u8) -> bool {
        if self.pos >= N {
            return false;
        }
        self.data[self.pos] = byte;
        self.pos += 1;
        true
    }

    /// Append all of `bytes`, or nothing if they do not fit.
    #[must_use]
    pub fn push_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available_size() {
            return false;
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        true
    }

    /// Drop `length` bytes from the front, shifting the rest down.
    #[must_use]
    pub fn remove(&mut self, length: usize) -> bool {
        if length > self.pos {
            return false;
        }
        if length == self.pos {
            self.pos = 0;
            return true;
        }
        self.data.copy_within(length..self.pos, 0);
        self.pos -= length;
        true
    }
}

impl<const N: usize> Default for WriteBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
