//! Client sessions and the fixed pool they live in

use crate::config::{MAX_CONNECTIONS, SESSION_BUFFER_SIZE};
use crate::read_buffer::ReadBuffer;
use crate::write_buffer::WriteBuffer;

/// Slot index of a session in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u8);

impl SessionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        if index < MAX_CONNECTIONS {
            Some(Self(index as u8))
        } else {
            None
        }
    }
}

/// State for one accepted connection
pub struct Session<H> {
    pub handle: Option<H>,
    pub read_buffer: ReadBuffer<SESSION_BUFFER_SIZE>,
    pub write_buffer: WriteBuffer<SESSION_BUFFER_SIZE>,
    pub in_use: bool,
    /// Set when received bytes may hold a complete frame
    pub data_pending: bool,
    /// Bytes the transport confirmed as sent, for diagnostics
    pub bytes_sent: usize,
}

impl<H: Copy> Session<H> {
    pub const fn new() -> Self {
        Self {
            handle: None,
            read_buffer: ReadBuffer::new(),
            write_buffer: WriteBuffer::new(),
            in_use: false,
            data_pending: false,
            bytes_sent: 0,
        }
    }

    /// Whether `work()` has anything to do for this session
    pub fn has_work(&self) -> bool {
        self.in_use && (self.data_pending || !self.write_buffer.is_empty())
    }

    fn claim(&mut self, handle: H) {
        self.handle = Some(handle);
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.data_pending = false;
        self.bytes_sent = 0;
        self.in_use = true;
    }

    /// Return the slot to the pool, handing back the transport handle if there was one
    pub fn release(&mut self) -> Option<H> {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.data_pending = false;
        self.bytes_sent = 0;
        self.in_use = false;
        self.handle.take()
    }
}

impl<H: Copy> Default for Session<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed array of sessions; never grows
pub struct SessionPool<H> {
    sessions: [Session<H>; MAX_CONNECTIONS],
}

impl<H: Copy> SessionPool<H> {
    pub fn new() -> Self {
        Self {
            sessions: core::array::from_fn(|_| Session::new()),
        }
    }

    /// Take the first free slot for `handle`
    pub fn claim(&mut self, handle: H) -> Option<SessionId> {
        let (index, session) = self
            .sessions
            .iter_mut()
            .enumerate()
            .find(|(_, session)| !session.in_use)?;
        session.claim(handle);
        SessionId::from_index(index)
    }

    pub fn get(&self, id: SessionId) -> &Session<H> {
        &self.sessions[id.index()]
    }

    pub fn get_mut(&mut self, id: SessionId) -> &mut Session<H> {
        &mut self.sessions[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = SessionId> + use<H> {
        (0..MAX_CONNECTIONS).filter_map(SessionId::from_index)
    }

    pub fn in_use_count(&self) -> usize {
        self.sessions.iter().filter(|session| session.in_use).count()
    }

    pub fn has_client_work(&self) -> bool {
        self.sessions.iter().any(Session::has_work)
    }
}

impl<H: Copy> Default for SessionPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_every_slot_once() {
        let mut pool = SessionPool::<u32>::new();
        for handle in 0..MAX_CONNECTIONS as u32 {
            let id = pool.claim(handle).unwrap();
            assert_eq!(id.index(), handle as usize);
        }
        assert_eq!(pool.claim(99), None);
        assert_eq!(pool.in_use_count(), MAX_CONNECTIONS);
    }

    #[test]
    fn released_slot_is_reused_empty() {
        let mut pool = SessionPool::<u32>::new();
        let first = pool.claim(1).unwrap();
        let session = pool.get_mut(first);
        assert!(session.read_buffer.write(&[1, 2, 3]));
        assert!(session.write_buffer.push(4));
        session.data_pending = true;
        assert!(pool.has_client_work());

        assert_eq!(pool.get_mut(first).release(), Some(1));
        assert_eq!(pool.get_mut(first).release(), None);
        assert!(!pool.has_client_work());

        let again = pool.claim(2).unwrap();
        assert_eq!(again, first);
        let session = pool.get(again);
        assert!(session.read_buffer.is_empty());
        assert!(session.write_buffer.is_empty());
        assert_eq!(session.handle, Some(2));
    }
}
