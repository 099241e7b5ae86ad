use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::{mem, ptr};

use crate::error::errno;
use crate::net::Endpoint;
use crate::{ConfigError, Error, Result};

/// Represents a TUN (network TUNnel) interface, a virtual network device that
/// acts as a software loopback for transferring IP packets between user space
/// and the kernel, operating at layer 3 of the OSI model.
#[derive(Debug)]
pub struct Tun {
    fd: File,
    name: String,
    packet_info: bool,
}

impl Tun {
    /// Creates a new TUN virtual network device.
    ///
    /// With `packet_info`, frames exchanged with the device follow this
    /// structure, which lets any address family cross the tunnel:
    ///
    /// - Flags [2 bytes]
    /// - Proto [2 bytes] [EtherType](https://en.wikipedia.org/wiki/EtherType)
    /// - Raw protocol (IP, IPv6, etc) frame
    ///
    /// Without it, frames only contain the raw protocol frame and both peers
    /// must agree on the address family.
    ///
    /// A `%d` in `dev` is replaced by the kernel with the first free index.
    ///
    /// # Errors
    ///
    /// Returns an error if the TUN device cannot be opened, if the name is too
    /// long or contains a null byte, or if the process does not have the
    /// required `CAP_NET_ADMIN` privilege.
    pub fn open(dev: &str, packet_info: bool) -> Result<Self> {
        // The interface name must be less than `IFNAMSIZ` bytes to leave room
        // for the null terminator.
        if dev.len() >= libc::IFNAMSIZ {
            return Err(ConfigError::InterfaceNameTooLong {
                provided: dev.len(),
                maximum: libc::IFNAMSIZ - 1,
            }
            .into());
        }

        if dev.as_bytes().contains(&0) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name contains a null byte",
            )));
        }

        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };

        // IFF_TUN   - TUN device (no Ethernet headers)
        //
        // IFF_NO_PI - Do not provide packet information
        let flags = if packet_info {
            libc::IFF_TUN
        } else {
            libc::IFF_TUN | libc::IFF_NO_PI
        };

        unsafe {
            // SAFETY: `dev.len()` is less than `IFNAMSIZ` and `ifr` is zeroed,
            // so the name stays null-terminated.
            ptr::copy_nonoverlapping(
                dev.as_ptr(),
                ifr.ifr_name.as_mut_ptr() as *mut u8,
                dev.len(),
            );

            ifr.ifr_ifru.ifru_flags = flags as i16;
        }

        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) } == -1 {
            return Err(errno!(
                "failed to bind network interface with TUN file handle"
            ));
        }

        // SAFETY: the kernel writes back a null-terminated name.
        let name = unsafe {
            CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        Ok(Self {
            fd,
            name,
            packet_info,
        })
    }

    /// Returns the assigned name of the TUN virtual network device.
    ///
    /// The name given for creating the TUN device is more of a suggestion
    /// to the kernel rather than a requirement, so the assigned name may be
    /// different than the one originally provided.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if frames carry the leading packet information bytes.
    pub fn packet_info(&self) -> bool {
        self.packet_info
    }

    /// Sets the TUN virtual network interface to be non-blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the file handle could not be set to non-blocking.
    pub fn set_non_blocking(&self) -> Result<()> {
        let fd = self.as_raw_fd();

        // Get current flags so they can be combined with `O_NONBLOCK`.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(errno!("failed to get flags of TUN file handle"));
        }

        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
            return Err(errno!("failed to set TUN file handle to non-blocking"));
        }

        Ok(())
    }
}

impl Endpoint for Tun {
    /// Receives one frame from the TUN virtual network device.
    ///
    /// The buffer should hold the interface MTU plus 4 bytes of leading
    /// packet information if configured.
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.fd).read(buf).map_err(|err| err.into())
    }

    /// Writes one frame to the TUN virtual network device.
    ///
    /// Many errors are silently handled by the OS kernel, often resulting in
    /// dropped packets, so a successful write does not mean the frame was
    /// routed.
    fn send(&self, buf: &[u8]) -> Result<usize> {
        (&self.fd).write(buf).map_err(|err| err.into())
    }
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tun_name_too_long_invalid() {
        let name = "x".repeat(libc::IFNAMSIZ);

        match Tun::open(&name, true) {
            Err(Error::Config(ConfigError::InterfaceNameTooLong { provided, maximum })) => {
                assert_eq!(provided, libc::IFNAMSIZ);
                assert_eq!(maximum, libc::IFNAMSIZ - 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn tun_name_null_byte_invalid() {
        let err = Tun::open("tun\0x", false).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
    }
}
