//! Error taxonomy for the DXL client (spec §7).
//!
//! User-visible calls either return a value, return an `ErrorResponse`
//! message (never raised), or fail with one of the variants below. Driver
//! and I/O failures never escape as raw `std::io::Error`s past the client
//! facade.

use thiserror::Error;

/// Fabric error code carried by an `Error` message (spec §6): the high bit
/// is always set.
pub const FABRIC_ERROR_MASK: i32 = 0x8000_0000_u32 as i32;
pub const FABRIC_SERVICE_UNAVAILABLE: i32 = 0x8000_0001_u32 as i32;

#[derive(Debug, Error)]
pub enum DxlError {
    /// Codec or config parse failed.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Broker descriptor invalid (spec §4.6).
    #[error("malformed broker descriptor: {0}")]
    MalformedBroker(String),

    /// Operation requires an active session.
    #[error("not connected")]
    NotConnected,

    /// Connect retries exhausted.
    #[error("not connectable: {0}")]
    NotConnectable(String),

    /// Sync operation did not complete within its deadline.
    #[error("operation timed out")]
    WaitTimeout,

    /// A service or the fabric itself reported an error for a request
    /// (spec §7). Carried as a value on `sync_request`'s `Result`, never
    /// delivered any other way.
    #[error("fabric error {code:#010x}: {message}")]
    Fabric { code: i32, message: String },

    /// Unexpected I/O or TLS failure; includes a cause chain.
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DxlError>;

impl From<std::io::Error> for DxlError {
    fn from(err: std::io::Error) -> Self {
        DxlError::Internal(err.into())
    }
}
