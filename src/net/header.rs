//! Protocol framing: the fixed header stamped on every datagram sent to the
//! peer.

use std::io;

use crate::config::Delays;
use crate::{Error, ParseError, Result};

/// Version of the framing understood by this build. Datagrams stamped with
/// any other version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Representation of the header prepended to every datagram sent to the peer.
///
/// ```text
///    0                   1                   2                   3
///    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |    Version    |                                               |
///   +-+-+-+-+-+-+-+-+                                               +
///   |                      Min Time (64 bits)                       |
///   +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |               |                                               |
///   +-+-+-+-+-+-+-+-+                                               +
///   |                      Max Time (64 bits)                       |
///   +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |               |                                               |
///   +-+-+-+-+-+-+-+-+                                               +
///   |                       Jitter (64 bits)                        |
///   +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |               |              Payload ...
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// All multi-byte fields are big-endian on the wire and host order in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Framing version of the sender.
    version: u8,
    /// Earliest time, in epoch milliseconds, the packet may be delivered. Zero
    /// means the packet may be delivered immediately.
    min_time: u64,
    /// Time, in epoch milliseconds, after which the packet is discarded
    /// instead of delivered. Zero means the packet never expires.
    max_time: u64,
    /// Width, in milliseconds, of the randomized spread after `min_time`.
    jitter: u64,
}

impl PacketHeader {
    /// Length of the header on the wire in bytes.
    pub const LEN: usize = 25;

    /// Creates a [PacketHeader] for a packet sent at `now` (epoch
    /// milliseconds) with the given release window.
    ///
    /// A zero minimum delay is encoded as a zero `min_time`, and a zero
    /// maximum delay as a zero `max_time`. The deadline is always measured
    /// from `now + min_ms`, even when the minimum itself is disabled.
    pub fn new(delays: &Delays, now: u64) -> Self {
        let release = now.saturating_add(delays.min_ms);

        Self {
            version: PROTOCOL_VERSION,
            min_time: if delays.min_ms == 0 { 0 } else { release },
            max_time: if delays.max_ms == 0 {
                0
            } else {
                release.saturating_add(delays.max_ms)
            },
            jitter: delays.jitter_ms,
        }
    }

    /// Returns the Version field from the [PacketHeader].
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the Min Time field from the [PacketHeader].
    pub fn min_time(&self) -> u64 {
        self.min_time
    }

    /// Returns the Max Time field from the [PacketHeader].
    pub fn max_time(&self) -> u64 {
        self.max_time
    }

    /// Returns the Jitter field from the [PacketHeader].
    pub fn jitter(&self) -> u64 {
        self.jitter
    }

    /// Returns the memory representation of the [PacketHeader] as a byte array
    /// in big-endian (network) byte order.
    pub fn to_be_bytes(&self) -> [u8; Self::LEN] {
        let mut raw_header = [0u8; Self::LEN];

        raw_header[0] = self.version;
        raw_header[1..9].copy_from_slice(&self.min_time.to_be_bytes());
        raw_header[9..17].copy_from_slice(&self.max_time.to_be_bytes());
        raw_header[17..25].copy_from_slice(&self.jitter.to_be_bytes());

        raw_header
    }

    /// Reads the [PacketHeader] from the given input stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the input stream fails or the header
    /// carries a different protocol version.
    pub fn read<T: io::Read>(input: &mut T) -> Result<Self> {
        let mut raw_header = [0u8; Self::LEN];
        input.read_exact(&mut raw_header[..])?;

        PacketHeader::try_from(&raw_header[..])
    }

    /// Writes the [PacketHeader] to the given output stream.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the output stream fails.
    pub fn write<T: io::Write>(&self, output: &mut T) -> Result<()> {
        output.write_all(&self.to_be_bytes())?;

        Ok(())
    }
}

impl TryFrom<&[u8]> for PacketHeader {
    type Error = Error;

    fn try_from(header_raw: &[u8]) -> Result<Self> {
        if header_raw.len() < Self::LEN {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: header_raw.len(),
                minimum: Self::LEN,
            }));
        }

        let version = header_raw[0];

        if version != PROTOCOL_VERSION {
            return Err(Error::Parse(ParseError::VersionMismatch {
                provided: version,
                expected: PROTOCOL_VERSION,
            }));
        }

        let field = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header_raw[at..at + 8]);
            u64::from_be_bytes(raw)
        };

        Ok(Self {
            version,
            min_time: field(1),
            max_time: field(9),
            jitter: field(17),
        })
    }
}

/// Frames `payload` for the peer, stamping it with the release window that
/// starts at `now` (epoch milliseconds).
///
/// Egress is never delayed locally; the receiving peer applies the window.
pub fn encode(payload: &[u8], delays: &Delays, now: u64) -> Vec<u8> {
    let header = PacketHeader::new(delays, now);

    let mut datagram = Vec::with_capacity(PacketHeader::LEN + payload.len());
    datagram.extend_from_slice(&header.to_be_bytes());
    datagram.extend_from_slice(payload);

    datagram
}

/// Parses a datagram received from the peer into its header and payload.
///
/// # Errors
///
/// Returns [ParseError::InvalidBufferLength] if the datagram is shorter than
/// the header, or [ParseError::VersionMismatch] if it was framed with another
/// protocol version. Either way the datagram must be discarded.
pub fn decode(datagram: &[u8]) -> Result<(PacketHeader, &[u8])> {
    let header = PacketHeader::try_from(datagram)?;

    Ok((header, &datagram[PacketHeader::LEN..]))
}
