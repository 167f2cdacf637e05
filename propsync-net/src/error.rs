//! Error types for propsync networking.
//!
//! Only connection establishment reports errors to the caller. Everything
//! after that is best-effort: publish, receive and apply failures are logged
//! where they happen and the offending message is dropped.
//!
//! | Variant | Surfaced to caller | Effect |
//! |---------|--------------------|--------|
//! | `RelayNotRunning`, `RelayBind`, `Connect` | yes, from `connect` | instance stays disconnected |
//! | `Transport` | no | message dropped, connection kept |
//! | `Encode`, `Decode`, `Malformed` | no | message dropped |
//! | `Apply` | no | registry-bound targets are unbound |
//! | `StaleAccessor` | no | send registration removed after the tick |

use std::io;

use thiserror::Error;

use propsync_types::HostError;

/// Result type alias for propsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Loopback connect without a relay listening and without permission to launch one.
    #[error("local relay not running on {address}:{port}")]
    RelayNotRunning { address: String, port: u16 },

    #[error("relay could not bind port {port}: {source}")]
    RelayBind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {address}:{port}: {source}")]
    Connect {
        address: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("cannot apply update for {path}: {source}")]
    Apply {
        path: String,
        #[source]
        source: HostError,
    },

    #[error("accessor for {path} is no longer valid: {source}")]
    StaleAccessor {
        path: String,
        #[source]
        source: HostError,
    },
}

impl SyncError {
    /// True for errors that leave the instance disconnected.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SyncError::RelayNotRunning { .. } | SyncError::RelayBind { .. } | SyncError::Connect { .. }
        )
    }
}
