//! WiFi credentials source
//!
//! Credentials are read again before every join attempt, so a store backed by
//! persistent settings can rotate them between attempts.

use crate::config;
use heapless::String;

pub const MAX_SSID_LENGTH: usize = 32;
pub const MAX_PASSWORD_LENGTH: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub ssid: String<MAX_SSID_LENGTH>,
    pub password: String<MAX_PASSWORD_LENGTH>,
}

impl Credentials {
    /// Fails if either value is longer than WiFi allows
    pub fn new(ssid: &str, password: &str) -> Option<Self> {
        Some(Self {
            ssid: ssid.try_into().ok()?,
            password: password.try_into().ok()?,
        })
    }
}

pub trait CredentialStore {
    fn credentials(&self) -> Credentials;
}

/// Credentials baked in at compile time from `WIFI_SSID` / `WIFI_PASSWORD`
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCredentials;

impl CredentialStore for StaticCredentials {
    fn credentials(&self) -> Credentials {
        // Over-long values were already flagged by build.rs; joining with an
        // empty SSID fails and is retried like any other join failure.
        Credentials::new(config::WIFI_SSID, config::WIFI_PASSWORD).unwrap_or_default()
    }
}

impl CredentialStore for Credentials {
    fn credentials(&self) -> Credentials {
        self.clone()
    }
}
