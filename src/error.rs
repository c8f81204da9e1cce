//! Error taxonomy for the connection engine.
//!
//! Three families of failures exist:
//!
//! - **Pre-connection**: nothing was opened yet (no target, malformed
//!   target, socket/connect failure).
//! - **Fatal** ("panic"): the connection is permanently broken. These are
//!   latched on the connection as a [`Fatal`] kind so that every thread
//!   still using it observes the failure promptly; afterwards the only
//!   valid operation is dropping the connection.
//! - **Per-call**: a single remote operation failed; the partially built
//!   request is rolled back and the connection stays usable.
//!
//! All failures propagate as `Result` values. The `Display` impl of
//! [`Error`] is the human-readable description; system-level detail (the
//! captured `io::Error`, or the name of the offending remote operation)
//! rides along in the variant payload.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // --- pre-connection ---
    #[error("TWDISPLAY is not set")]
    NoDisplay,
    #[error("badly formed display target {0:?}")]
    BadDisplay(String),
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),

    // --- fatal, connection-level ---
    #[error("connection lost (explicit kill or server shutdown)")]
    ConnectionLost,
    #[error("failed to send data to server: {0}")]
    Write(#[source] io::Error),
    #[error("server has incompatible protocol version, impossible to connect")]
    ProtocolVersion,
    #[error("server has different data sizes, impossible to connect")]
    DataSizes,
    #[error("server has reversed endianity, impossible to connect")]
    ByteOrder,
    #[error("bad or missing authorization file ~/.TwinAuth, cannot connect")]
    NoAuth,
    #[error("server denied permission to connect, file ~/.TwinAuth may be wrong")]
    AuthDenied,
    #[error("got strange data from server, protocol violated")]
    Protocol,
    #[error("got invalid data from server, compressed stream violated")]
    BadCompressedData,
    #[error("internal compression error")]
    Compression,

    // --- per-call, recoverable ---
    #[error("operation not supported by server: {0}")]
    NoSuchOp(&'static str),
    #[error("argument list does not match operation signature: {0}")]
    BadArgs(&'static str),
    #[error("operation rejected by server: {0}")]
    RejectedCall(&'static str),
    #[error("operation rejected by server, invalid arguments: {0}")]
    RejectedArgs(&'static str),
    #[error("operation reply is structurally inconsistent: {0}")]
    StrangeReply(&'static str),
}

impl Error {
    /// Whether this error permanently breaks the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost
                | Error::Write(_)
                | Error::ProtocolVersion
                | Error::DataSizes
                | Error::ByteOrder
                | Error::NoAuth
                | Error::AuthDenied
                | Error::Protocol
                | Error::BadCompressedData
                | Error::Compression
        )
    }
}

/// Latched fatal state, kept on the connection after a panic so that
/// concurrent and subsequent operations can re-report the original cause.
/// A lightweight mirror of the fatal [`Error`] variants: the raw OS error
/// number is kept instead of the full `io::Error` so the kind stays `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    ConnectionLost,
    Write(Option<i32>),
    ProtocolVersion,
    DataSizes,
    ByteOrder,
    NoAuth,
    AuthDenied,
    Protocol,
    BadCompressedData,
    Compression,
}

impl Fatal {
    pub(crate) fn write_error(e: &io::Error) -> Fatal {
        Fatal::Write(e.raw_os_error())
    }

    pub fn into_error(self) -> Error {
        match self {
            Fatal::ConnectionLost => Error::ConnectionLost,
            Fatal::Write(Some(errno)) => Error::Write(io::Error::from_raw_os_error(errno)),
            Fatal::Write(None) => Error::Write(io::ErrorKind::BrokenPipe.into()),
            Fatal::ProtocolVersion => Error::ProtocolVersion,
            Fatal::DataSizes => Error::DataSizes,
            Fatal::ByteOrder => Error::ByteOrder,
            Fatal::NoAuth => Error::NoAuth,
            Fatal::AuthDenied => Error::AuthDenied,
            Fatal::Protocol => Error::Protocol,
            Fatal::BadCompressedData => Error::BadCompressedData,
            Fatal::Compression => Error::Compression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_round_trips_to_error() {
        assert!(Fatal::ConnectionLost.into_error().is_fatal());
        assert!(Fatal::Write(Some(32)).into_error().is_fatal());
        assert!(Fatal::AuthDenied.into_error().is_fatal());
    }

    #[test]
    fn per_call_errors_are_not_fatal() {
        assert!(!Error::NoSuchOp("Stat").is_fatal());
        assert!(!Error::RejectedArgs("Stat").is_fatal());
        assert!(!Error::NoDisplay.is_fatal());
    }

    #[test]
    fn descriptions_mention_detail() {
        let e = Error::NoSuchOp("ChangeField");
        assert!(e.to_string().contains("ChangeField"));
    }
}
