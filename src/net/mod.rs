//! Timed-delivery engine of the tunnel.
//!
//! Outbound packets are framed with a release window by [header], inbound
//! packets wait in the [scheduler] until their window opens, and the
//! [event_loop] ties both endpoints and the scheduler together.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Result;

pub mod event_loop;
pub mod header;
pub mod scheduler;
pub mod transport;

pub use event_loop::{Shutdown, Stats, Tunnel};
pub use header::{PROTOCOL_VERSION, PacketHeader, decode, encode};
pub use scheduler::{Counters, Packet, QueueEntry, Scheduler};
pub use transport::Transport;

/// One side of the tunnel that moves whole datagrams.
///
/// Each call reads or writes exactly one logical unit of traffic (an IP frame
/// for the TUN device, a datagram for the transport socket). Endpoints are
/// expected to be non-blocking; readiness is the event loop's concern.
pub trait Endpoint: fmt::Debug {
    /// Receives one datagram into `buf`, returning its length.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram could not be read.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Sends `buf` as one datagram, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram could not be written.
    fn send(&self, buf: &[u8]) -> Result<usize>;
}

/// Returns the current wall-clock time as milliseconds since the UNIX epoch.
///
/// Both peers stamp and compare release windows in this clock domain.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
