// SPDX-License-Identifier: MIT
//
// Pit Boss LAN Controller
// https://github.com/pitboss-lan/pitboss-lan

//! Error types for the controller core
//!
//! Provides a unified error taxonomy using `thiserror`. Transport errors
//! feed the reducer as `Offline`; authentication errors feed it as
//! `AuthFail`; everything else is surfaced to the caller. Rate-limited
//! rediscovery is deliberately not an error; it comes back as a
//! `RediscoveryOutcome` variant.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for grill operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP connect to the grill failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// Request was sent but the exchange failed mid-flight
    #[error("send failed: {0}")]
    Send(String),

    /// Connect or I/O exceeded the request timeout
    #[error("request timed out")]
    Timeout,

    /// Both the primary and the alternate password token were rejected
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Response parsed, but required fields were absent or malformed
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Caller-supplied argument rejected before any I/O
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Arming a scheduled health-check timer failed
    #[error("timer arm failed: {0}")]
    TimerArmFailed(String),

    /// Preference or configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Transport failures are what the reducer treats as `Offline`.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Send(_) | Error::Timeout | Error::ProtocolDecode(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthenticationFailed)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else if e.is_connect() {
            Error::Connect(e.to_string())
        } else if e.is_decode() {
            Error::ProtocolDecode(e.to_string())
        } else {
            Error::Send(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ProtocolDecode(e.to_string())
    }
}
