//! Error types shared by every part of the tunnel.

use std::{io, result};

use thiserror::Error;

/// Creates a [`crate::Error::Io`] with a custom message prefixed to the current
/// `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur while running the tunnel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred on one of the tunnel endpoints.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A datagram received from the peer could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The tunnel was configured with invalid options.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Returns `true` if the error only affects the current datagram or is
    /// expected to clear up on its own, so the event loop should log it and
    /// keep running.
    ///
    /// Anything else means an endpoint is gone and the tunnel cannot continue.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(err) => {
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionRefused
                ) {
                    return true;
                }

                // The peer's route or the socket buffers may come back, and a
                // frame the device refuses or the socket cannot carry only
                // costs that one datagram.
                matches!(
                    err.raw_os_error(),
                    Some(
                        libc::ENOBUFS
                            | libc::EHOSTUNREACH
                            | libc::ENETUNREACH
                            | libc::EINVAL
                            | libc::EMSGSIZE
                    )
                )
            }
            Error::Parse(_) => true,
            Error::Config(_) => false,
        }
    }
}

/// Represents errors that can occur while parsing a tunnel datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The input buffer is smaller than the fixed header length.
    #[error(
        "invalid buffer length: {provided} bytes (less than minimum required {minimum} bytes)"
    )]
    InvalidBufferLength {
        /// The length of the input buffer provided.
        provided: usize,
        /// The minimum required length for the header.
        minimum: usize,
    },
    /// The datagram was framed with a different protocol version.
    #[error("protocol version mismatch: {provided} (expected {expected})")]
    VersionMismatch {
        /// The version value provided.
        provided: u8,
        /// The locally supported version.
        expected: u8,
    },
}

/// Represents errors in the tunnel configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A delay option is negative, not a number, or too large.
    #[error("invalid {option}: {value} (must be a non-negative number of seconds)")]
    InvalidDelay {
        /// The name of the offending option.
        option: &'static str,
        /// The value provided.
        value: f64,
    },
    /// The requested interface name does not fit in `IFNAMSIZ`.
    #[error("interface name too long: {provided} bytes (maximum allowed {maximum} bytes)")]
    InterfaceNameTooLong {
        /// The length of the name provided.
        provided: usize,
        /// The maximum length allowed.
        maximum: usize,
    },
}
