//! Transport provider interface
//!
//! The engine never touches the radio or the TCP/IP stack directly. Everything
//! it needs from them goes through [`Transport`]. Events flowing the other way
//! (accepted connections, received data, send completions, errors) are
//! delivered by the provider calling the `on_*` methods of
//! [`crate::wifi::WifiSubsystem`].

use crate::mdns::ServiceRecord;
use crate::session::SessionId;

/// Link state as reported by the WiFi driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Interface is down
    Down,
    /// Join in progress
    Joining,
    /// Associated but no IP address yet
    NoIp,
    /// Associated with an IP address
    Up,
    /// Join failed for an unspecified reason
    Failed,
    /// The configured network was not found
    NoNetwork,
    /// The access point rejected the credentials
    BadAuth,
}

/// Radio state as last reported by a driver task running outside the engine.
///
/// Providers whose driver calls wait on the radio cache this instead of
/// querying the driver from [`Transport::link_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Down,
    Joining,
    Associated { rssi: Option<i32> },
    Failed,
}

impl RadioState {
    pub fn link_status(self, has_address: bool) -> LinkStatus {
        match self {
            RadioState::Associated { .. } if has_address => LinkStatus::Up,
            RadioState::Associated { .. } => LinkStatus::NoIp,
            RadioState::Joining => LinkStatus::Joining,
            RadioState::Failed => LinkStatus::Failed,
            RadioState::Down => LinkStatus::Down,
        }
    }

    pub fn rssi(self) -> Option<i32> {
        match self {
            RadioState::Associated { rssi } => rssi,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The stack ran out of memory for the operation
    OutOfMemory,
    /// The operation cannot be performed right now
    Busy,
    /// The connection is already closed or was reset by the peer
    Closed,
    /// Any other driver or stack error code
    Other(i32),
}

pub trait Transport {
    /// Identifies one accepted connection
    type Handle: Copy + PartialEq + core::fmt::Debug;

    /// Start joining `ssid`. Returns as soon as the request is issued.
    fn join(&mut self, ssid: &str, password: &str) -> Result<(), TransportError>;

    fn link_status(&mut self) -> LinkStatus;

    /// Received signal strength, when the driver can report it
    fn rssi(&mut self) -> Option<i32>;

    fn ip_address(&mut self) -> Option<[u8; 4]>;

    /// Bind and listen on `port`, delivering new connections through `on_accept`
    fn listen(&mut self, port: u16) -> Result<(), TransportError>;

    fn close_listener(&mut self);

    /// Route callbacks for `handle` to `session` from now on
    fn bind_session(&mut self, handle: Self::Handle, session: SessionId);

    /// Stop delivering callbacks for `handle`
    fn unbind_session(&mut self, handle: Self::Handle);

    /// Bytes the connection can accept right now
    fn send_window(&mut self, handle: Self::Handle) -> usize;

    /// Queue `data` for sending. Never blocks; `data` must fit in the send window.
    fn send(&mut self, handle: Self::Handle, data: &[u8]) -> Result<(), TransportError>;

    /// Tell the stack `length` received bytes were consumed
    fn acknowledge(&mut self, handle: Self::Handle, length: usize);

    fn close(&mut self, handle: Self::Handle) -> Result<(), TransportError>;

    /// Tear the connection down without a graceful close
    fn abort(&mut self, handle: Self::Handle);

    /// (Re)publish the discovery record on the current link
    fn announce(&mut self, record: &ServiceRecord);
}
