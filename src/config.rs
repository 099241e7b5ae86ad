//! Command-line configuration for the tunnel.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::{ConfigError, Result};

/// Default name handed to the kernel when creating the TUN device. The kernel
/// replaces `%d` with the first free index.
pub const DEFAULT_INTERFACE: &str = "dejitun%d";

/// Default local UDP port.
pub const DEFAULT_PORT: u16 = 12345;

/// Options accepted on the command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "dejitun", version)]
#[command(about = "Point-to-point tunnel that delays packets to remove network jitter")]
pub struct Options {
    /// Min (optimal) delay in seconds
    #[arg(
        short = 'd',
        long,
        value_name = "SECS",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub min_delay: f64,

    /// Max delay (drop limit) in seconds, counted from the min delay
    #[arg(
        short = 'D',
        long,
        value_name = "SECS",
        default_value_t = 10.0,
        allow_negative_numbers = true
    )]
    pub max_delay: f64,

    /// Jitter between min and min+jitter, in seconds
    #[arg(
        short = 'j',
        long,
        value_name = "SECS",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub jitter: f64,

    /// Name of the tunnel device
    #[arg(short = 'i', long, value_name = "NAME", default_value = DEFAULT_INTERFACE)]
    pub interface: String,

    /// Local port to listen on
    #[arg(short = 'p', long, value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Expert use only: turn off address family info in the tunnel
    #[arg(short = 'A', long)]
    pub no_packet_info: bool,

    /// Write verbose (debug) output to this file
    #[arg(short = 'v', long, value_name = "FILE")]
    pub debug_file: Option<PathBuf>,

    /// Remote peer host
    pub peer_host: String,

    /// Remote peer port
    pub peer_port: u16,
}

impl Options {
    /// Converts the delay options to whole milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if any delay is negative, not finite, or too large to
    /// represent.
    pub fn delays(&self) -> Result<Delays> {
        Ok(Delays {
            min_ms: secs_to_millis("min delay", self.min_delay)?,
            max_ms: secs_to_millis("max delay", self.max_delay)?,
            jitter_ms: secs_to_millis("jitter", self.jitter)?,
        })
    }

    /// Resolves the remote peer to a socket address, taking the first result.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let mut addrs = (self.peer_host.as_str(), self.peer_port).to_socket_addrs()?;

        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for peer {}", self.peer_host),
            )
            .into()
        })
    }
}

/// Release window applied to outbound packets, in milliseconds.
///
/// A zero `min_ms` or `max_ms` disables that half of the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delays {
    /// Earliest delivery, relative to the time a packet is sent.
    pub min_ms: u64,
    /// Deadline, relative to the earliest delivery.
    pub max_ms: u64,
    /// Width of the randomized spread after the earliest delivery.
    pub jitter_ms: u64,
}

fn secs_to_millis(option: &'static str, secs: f64) -> Result<u64> {
    let invalid = ConfigError::InvalidDelay {
        option,
        value: secs,
    };

    let duration = Duration::try_from_secs_f64(secs).map_err(|_| invalid.clone())?;

    u64::try_from(duration.as_millis()).map_err(|_| invalid.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults() {
        let opts = parse(&["dejitun", "peer.example", "4000"]);

        assert_eq!(opts.min_delay, 0.0);
        assert_eq!(opts.max_delay, 10.0);
        assert_eq!(opts.jitter, 0.0);
        assert_eq!(opts.interface, DEFAULT_INTERFACE);
        assert_eq!(opts.port, DEFAULT_PORT);
        assert!(!opts.no_packet_info);
        assert!(opts.debug_file.is_none());
        assert_eq!(opts.peer_host, "peer.example");
        assert_eq!(opts.peer_port, 4000);

        let delays = opts.delays().unwrap();
        assert_eq!(
            delays,
            Delays {
                min_ms: 0,
                max_ms: 10_000,
                jitter_ms: 0,
            }
        );
    }

    #[test]
    fn short_flags() {
        let opts = parse(&[
            "dejitun", "-d", "0.25", "-D", "1.5", "-j", "0.01", "-i", "tun7", "-p", "999", "-A",
            "-v", "/tmp/dejitun.log", "10.0.0.1", "12345",
        ]);

        assert_eq!(opts.interface, "tun7");
        assert_eq!(opts.port, 999);
        assert!(opts.no_packet_info);
        assert_eq!(opts.debug_file, Some(PathBuf::from("/tmp/dejitun.log")));

        let delays = opts.delays().unwrap();
        assert_eq!(delays.min_ms, 250);
        assert_eq!(delays.max_ms, 1500);
        assert_eq!(delays.jitter_ms, 10);
    }

    #[test]
    fn missing_peer_is_rejected() {
        assert!(Options::try_parse_from(["dejitun", "10.0.0.1"]).is_err());
        assert!(Options::try_parse_from(["dejitun"]).is_err());
    }

    #[test]
    fn negative_delay_is_rejected() {
        let opts = parse(&["dejitun", "-d", "-1", "10.0.0.1", "12345"]);

        match opts.delays() {
            Err(Error::Config(ConfigError::InvalidDelay { option, .. })) => {
                assert_eq!(option, "min delay");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_finite_delay_is_rejected() {
        let opts = parse(&["dejitun", "-D", "inf", "10.0.0.1", "12345"]);
        assert!(opts.delays().is_err());

        let opts = parse(&["dejitun", "-j", "NaN", "10.0.0.1", "12345"]);
        assert!(opts.delays().is_err());
    }

    #[test]
    fn peer_addr_resolves_literal() {
        let opts = parse(&["dejitun", "127.0.0.1", "4000"]);
        let addr = opts.peer_addr().unwrap();

        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }
}
