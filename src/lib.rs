//! Point-to-point tunnel that delays packets into a fixed release window to
//! smooth out network jitter.
//!
//! Frames read from a local TUN device are stamped with a release window and
//! sent to the peer over UDP. The receiving side holds each packet until its
//! window opens and drops it once the deadline has passed.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!(
    "This crate is only compatible with Linux systems that support TUN/TAP devices and the epoll interface."
);

pub mod config;
pub mod error;
pub mod log;
pub mod net;
pub mod tun_tap;

pub use error::{ConfigError, Error, ParseError, Result};
