//! Error types for the SPUD substrate.

use std::io;

use crate::wire::cbor::CborError;

/// Result type for SPUD operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the SPUD substrate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying OS error (socket, signal, or pipe operation).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An argument was invalid beyond what the type system enforces.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Operation attempted in a state that doesn't support it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Allocation failure (surfaced rather than aborted so callers can
    /// decide what to do, matching the original's `LS_ERR_NO_MEMORY`).
    #[error("out of memory")]
    NoMemory,

    /// A fixed-size buffer could not hold the requested payload.
    #[error("buffer overflow")]
    Overflow,

    /// Failed to reach a remote endpoint.
    #[error("socket connect error: {0}")]
    SocketConnect(String),

    /// Data could not be parsed by the consuming entity.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// A CBOR-level decoding error, carrying the framer's own enumerant.
    #[error("cbor error: {0}")]
    Cbor(#[from] CborError),

    /// Protocol violation not otherwise covered above.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested item could not be found (unknown event name, etc).
    #[error("not found: {0}")]
    NotFound(String),

    /// The cryptographic RNG could not produce bytes.
    #[error("no entropy available")]
    NoEntropy,

    /// Feature not implemented.
    #[error("not implemented: {0}")]
    NoImpl(String),

    /// An operation did not complete within its allotted time.
    #[error("timed out")]
    Timeout,

    /// A `getaddrinfo(3)` failure, carrying its `gai_strerror` message.
    /// Distinct from [`Error::Io`] because `getaddrinfo` errors aren't
    /// `errno` values and need their own lookup table.
    #[error("address resolution failed: {0}")]
    GetAddrInfo(String),
}

impl Error {
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn bad_format(msg: impl Into<String>) -> Self {
        Self::BadFormat(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True for errors that are expected during ordinary operation of a
    /// long-running loop (malformed datagrams, etc) and should be logged
    /// and shrugged off rather than propagated.
    pub fn is_recoverable_in_loop(&self) -> bool {
        matches!(self, Self::BadFormat(_) | Self::Cbor(_) | Self::Protocol(_))
    }
}
