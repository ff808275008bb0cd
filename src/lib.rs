#![cfg_attr(target_arch = "riscv32", no_std)]

//! ESP32-C3 LED Fixture Network Library
//!
//! This library implements the network side of a WiFi-controllable multi-channel
//! LED fixture: the connection lifecycle, a fixed pool of TCP client sessions and
//! the length-prefixed request/response protocol spoken over them.
//!
//! The engine is hardware independent and talks to the network through the
//! [`transport::Transport`] trait. On the device that trait is implemented on top of
//! esp-wifi and embassy-net (see `embassy_transport`); on the host it is mocked by
//! the tests.

extern crate alloc;

pub mod alarm;
pub mod credentials;
pub mod mdns;
pub mod protocol;
pub mod read_buffer;
pub mod session;
pub mod state_machine;
pub mod transport;
pub mod wifi;
pub mod write_buffer;

#[cfg(target_arch = "riscv32")]
pub mod embassy_transport;

// Console output goes to the UART/JTAG console on the device and to stdout on the host.
#[cfg(target_arch = "riscv32")]
pub(crate) use esp_println::println;
#[cfg(not(target_arch = "riscv32"))]
pub(crate) use std::println;

/// Project version information
pub const VERSION: &str = "0.1.0-dev";

/// Default configuration constants
pub mod config {
    /// TCP port the protocol server listens on
    pub const LISTEN_PORT: u16 = 5050;

    /// Maximum number of simultaneously connected clients
    pub const MAX_CONNECTIONS: usize = 8;

    /// Size of each session's inbound and outbound buffer
    pub const SESSION_BUFFER_SIZE: usize = 2048;

    /// Number of light outputs reported in the state snapshot
    pub const OUTPUT_COUNT: usize = 2;

    /// mDNS service type and protocol labels
    pub const MDNS_SERVICE: &str = "_fixture";
    pub const MDNS_PROTOCOL: &str = "_tcp";

    /// Hostname prefix, followed by the hardware id in hex
    pub const HOSTNAME_PREFIX: &str = "Fixture_";

    /// WiFi configuration
    /// Read from environment variables at compile time
    pub const WIFI_SSID: &str = env!("WIFI_SSID");
    pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");

    /// Delay before retrying a failed WiFi join, in milliseconds
    pub const WIFI_CONNECT_RETRY_MS: u64 = 5000;

    /// Link verification period while serving, in milliseconds
    pub const VERIFY_CONNECTION_EVERY_MS: u64 = 1000;

    /// A join that has not produced a link after this long counts as failed
    pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 10000;

    /// Static device identity reported through `SystemInfo`
    pub const MODEL: &str = "Fixture RGBCW";
    pub const MANUFACTURER: &str = "Fixture Labs";
    pub const FIRMWARE_VERSION: (u32, u32, u32) = (0, 1, 0);
    pub const HARDWARE_VERSION: (u32, u32, u32) = (1, 0, 0);
}

/// Error types for the light fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureError {
    /// The WiFi join request could not be issued
    WiFiError,
    /// The listening endpoint could not be created
    ListenError,
    /// A client session could not be opened or was refused
    SessionError,
    /// mDNS service error
    MdnsError,
}

impl core::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            FixtureError::WiFiError => "failed to start WiFi join",
            FixtureError::ListenError => "failed to open listening endpoint",
            FixtureError::SessionError => "session refused",
            FixtureError::MdnsError => "mDNS error",
        };
        f.write_str(message)
    }
}
