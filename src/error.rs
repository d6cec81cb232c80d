//! # Error Types
//!
//! Error taxonomy for the transport.
//!
//! Two layers of error reporting exist side by side:
//! - [`TransportError`] is the `Result` error type returned by fallible
//!   operations (reads, writes, handshake steps, configuration loading).
//! - [`Fault`] is the reduced set of connection faults surfaced to the
//!   `on_error` hook of a running connection, each carrying a fixed
//!   terminal-or-recoverable policy.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

use crate::core::package::PackageType;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Framing errors
    pub const ERR_NEGATIVE_LENGTH: &str = "negative payload length";
    pub const ERR_OVERSIZED_PAYLOAD: &str = "payload length exceeds the frame cap";
    pub const ERR_TRUNCATED_FRAME: &str = "frame shorter than its header claims";
    pub const ERR_UNKNOWN_PACKAGE_TAG: &str = "unknown package type tag";
    pub const ERR_UNKNOWN_DATA_TAG: &str = "unknown data type tag";

    /// Join failure reasons
    pub const ERR_PASSWORD_REQUIRED: &str = "server requires encryption but no password was given";
    pub const ERR_CHALLENGE_MISMATCH: &str = "challenge response did not match";
    pub const ERR_PEER_REJECTED_RESPONSE: &str = "peer rejected our challenge response";
    pub const ERR_BAD_AUTH_MATERIAL: &str = "auth salt or IV had the wrong length";
    pub const ERR_BAD_SETTINGS_PAYLOAD: &str = "auth info carried malformed settings";
    pub const ERR_VALIDATION_FAILED: &str = "connection validation round failed";
    pub const ERR_PEER_FAILED_VALIDATION: &str = "peer reported a failed validation round";

    /// Crypto errors
    pub const ERR_DECRYPTION_FAILED: &str = "decryption failed";
    pub const ERR_KEY_DERIVATION: &str = "key derivation failed";

    /// String payload errors
    pub const ERR_UTF16_LENGTH: &str = "string payload length is not a multiple of two";
    pub const ERR_UTF16_INVALID: &str = "string payload is not valid UTF-16";

    /// Endpoint state errors
    pub const ERR_ALREADY_CONNECTED: &str = "client endpoint is already connected";
    pub const ERR_NOT_CONNECTED: &str = "client endpoint is not connected";
    pub const ERR_HANDLER_CLOSED: &str = "package handler is closed";
}

/// Primary error type for all transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("read timed out")]
    ReadTimeout,

    #[error("stream broken while reading")]
    CannotRead,

    #[error("stream broken while writing")]
    CannotWrite,

    #[error("peer disconnected")]
    Disconnected,

    #[error("error package received")]
    ErrorPackage,

    #[error("unexpected package type {got:?}")]
    UnexpectedPackage { got: PackageType },

    #[error("ping timed out")]
    PingTimeout,

    #[error("validation round mismatch")]
    IncorrectPackage,

    #[error("framing error: {0}")]
    Frame(&'static str),

    #[error("join failed: {0}")]
    JoinFailed(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("crypto failure: {0}")]
    Crypto(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("endpoint state error: {0}")]
    State(&'static str),
}

impl TransportError {
    /// Map this error onto the connection fault it represents, if any.
    ///
    /// Errors with no fault mapping (configuration, cancellation, join
    /// outcomes) never reach a running connection's error hook.
    pub fn as_fault(&self) -> Option<Fault> {
        match self {
            TransportError::ReadTimeout => Some(Fault::ReadTimeout),
            TransportError::CannotRead | TransportError::Io(_) => Some(Fault::CannotRead),
            TransportError::CannotWrite => Some(Fault::CannotWrite),
            TransportError::Disconnected => Some(Fault::Disconnected),
            TransportError::ErrorPackage => Some(Fault::ErrorPackage),
            TransportError::UnexpectedPackage { .. } | TransportError::Frame(_) => {
                Some(Fault::UnexpectedPackage)
            }
            TransportError::PingTimeout => Some(Fault::PingTimeout),
            TransportError::IncorrectPackage | TransportError::Crypto(_) => {
                Some(Fault::IncorrectPackage)
            }
            _ => None,
        }
    }
}

/// Connection faults surfaced to the `on_error` hook of a running
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// A byte past the first of a frame missed its read deadline.
    ReadTimeout,
    /// The stream broke on the read side.
    CannotRead,
    /// The stream broke on the write side.
    CannotWrite,
    /// The peer indicated disconnect or the stream ended cleanly.
    Disconnected,
    /// The peer sent an `Error` package.
    ErrorPackage,
    /// A frame arrived that the protocol state did not allow.
    UnexpectedPackage,
    /// No pong or data arrived within the ping budget.
    PingTimeout,
    /// A validation round or payload decryption mismatched.
    IncorrectPackage,
}

impl Fault {
    /// Terminal faults end the session; the rest run the panic recovery
    /// handshake.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Fault::CannotRead | Fault::CannotWrite | Fault::Disconnected
        )
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Fault::ReadTimeout => "read_timeout",
            Fault::CannotRead => "cannot_read",
            Fault::CannotWrite => "cannot_write",
            Fault::Disconnected => "disconnected",
            Fault::ErrorPackage => "error_package",
            Fault::UnexpectedPackage => "unexpected_package",
            Fault::PingTimeout => "ping_timeout",
            Fault::IncorrectPackage => "incorrect_package",
        };
        f.write_str(name)
    }
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
