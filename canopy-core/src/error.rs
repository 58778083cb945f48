//! Error types shared across the Canopy workspace.
//!
//! Wire responses carry errors as a 32-bit POSIX-style code plus an optional
//! free-form string, so every variant maps to a stable `errnum()`.

use std::io;
use thiserror::Error;

/// POSIX-style error codes used on the wire.
///
/// These are fixed protocol constants, not whatever the host libc defines.
pub mod errnum {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const EROFS: i32 = 30;
    pub const EDEADLK: i32 = 35;
    pub const ENOSYS: i32 = 38;
    pub const ENODATA: i32 = 61;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const ETIMEDOUT: i32 = 110;
    pub const EHOSTUNREACH: i32 = 113;
}

/// Main error type for Canopy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame, wrong magic/version, flag/type contradiction.
    /// The offending message is dropped and logged; the peer stays connected.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Peer uuid not in the table, or a mandatory send failed.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// Rolemask mismatch, or a key file with unacceptable permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Optimistic-concurrency version mismatch; retryable.
    #[error("resource deadlock avoided")]
    Deadlock,

    /// Write to a read-only key.
    #[error("read-only file system")]
    ReadOnly,

    /// Terminal status for a streaming RPC that completed successfully.
    #[error("no data available")]
    NoData,

    /// No handler matched the topic, or the service was torn down.
    #[error("no such service: {0}")]
    NoSuchService(String),

    /// Name or resource already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// Name or resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Counter or buffer size limit exceeded.
    #[error("overflow: {0}")]
    Overflow(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A bounded wait elapsed before fulfillment.
    #[error("operation timed out")]
    Timeout,

    /// Error carried in a response message from a remote peer.
    #[error("remote error {errnum}: {msg}")]
    Remote { errnum: i32, msg: String },

    /// IO error during socket or file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for Canopy operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// The numeric code this error travels under in a response message.
    #[must_use]
    pub fn errnum(&self) -> i32 {
        match self {
            Self::Protocol(_) => errnum::EPROTO,
            Self::HostUnreachable(_) => errnum::EHOSTUNREACH,
            Self::PermissionDenied(_) => errnum::EPERM,
            Self::Deadlock => errnum::EDEADLK,
            Self::ReadOnly => errnum::EROFS,
            Self::NoData => errnum::ENODATA,
            Self::NoSuchService(_) => errnum::ENOSYS,
            Self::Exists(_) => errnum::EEXIST,
            Self::NotFound(_) => errnum::ENOENT,
            Self::Overflow(_) => errnum::EOVERFLOW,
            Self::Invalid(_) => errnum::EINVAL,
            Self::Timeout => errnum::ETIMEDOUT,
            Self::Remote { errnum, .. } => *errnum,
            Self::Io(e) => e.raw_os_error().unwrap_or(errnum::EINVAL),
        }
    }

    /// Reconstruct an error from a wire `(errnum, text)` pair.
    #[must_use]
    pub fn from_wire(code: i32, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            errnum::EDEADLK => Self::Deadlock,
            errnum::EROFS => Self::ReadOnly,
            errnum::ENODATA => Self::NoData,
            errnum::ENOSYS => Self::NoSuchService(msg),
            errnum::EPERM => Self::PermissionDenied(msg),
            errnum::EHOSTUNREACH => Self::HostUnreachable(msg),
            errnum::EPROTO => Self::Protocol(msg),
            _ => Self::Remote { errnum: code, msg },
        }
    }

    /// True for the terminal ENODATA status ending a streaming RPC.
    #[must_use]
    pub fn is_stream_end(&self) -> bool {
        self.errnum() == errnum::ENODATA
    }

    /// True for errors worth retrying after re-reading state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock)
    }
}
