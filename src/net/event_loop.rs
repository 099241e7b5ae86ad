//! Event loop multiplexing the TUN device, the transport socket, signals and
//! the delivery scheduler on a single thread.
//!
//! Each tick waits at most [TICK_MS] for either endpoint to become readable,
//! forwards at most one frame in each direction, then drains the scheduler.
//! The tick length is the resolution of every release and drop decision.

use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::{fmt, io, mem, ptr};

use tracing::{debug, info, trace, warn};

use crate::Result;
use crate::config::Delays;
use crate::error::errno;
use crate::net::header;
use crate::net::scheduler::{Counters, Packet, Scheduler};
use crate::net::transport::MAX_DATAGRAM;
use crate::net::{Endpoint, epoch_millis};

/// The number of milliseconds that `epoll_wait()` blocks for each tick.
pub const TICK_MS: i32 = 10;

/// Total number of events returned each tick (event loop cycle).
const EPOLL_MAX_EVENTS: usize = 4;

const DEV_TOKEN: u64 = 0;
const NET_TOKEN: u64 = 1;
const SIGNAL_TOKEN: u64 = 2;
const SHUTDOWN_TOKEN: u64 = 3;

/// Traffic counters of a [Tunnel].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Frames read from the device and sent to the peer.
    pub forwarded: u64,
    /// Frames read from the device that could not be sent to the peer.
    pub unsent: u64,
    /// Datagrams from the peer accepted into the scheduler.
    pub received: u64,
    /// Datagrams from the peer discarded as malformed or foreign.
    pub rejected: u64,
    /// Packets currently waiting in the scheduler.
    pub queued: usize,
    /// Delivery counters of the scheduler.
    pub delivery: Counters,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forwarded={} unsent={} received={} rejected={} queued={} sent={} dropped={} failed={}",
            self.forwarded,
            self.unsent,
            self.received,
            self.rejected,
            self.queued,
            self.delivery.sent,
            self.delivery.dropped,
            self.delivery.failed,
        )
    }
}

/// Handle that asks a running [Tunnel] to stop.
///
/// The tunnel finishes its current tick, discards its queue and returns from
/// [Tunnel::run]. Handles can be cloned and sent to other threads.
#[derive(Debug, Clone)]
pub struct Shutdown {
    fd: Arc<OwnedFd>,
}

impl Shutdown {
    fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(errno!("failed to create event_fd"));
        }

        Ok(Self {
            // SAFETY: `fd` was just created and is owned by nothing else.
            fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    /// Signals the tunnel to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the event loop could not be notified.
    pub fn trigger(&self) -> Result<()> {
        let one: u64 = 1;

        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &raw const one as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n == -1 {
            return Err(errno!("failed to notify event loop"));
        }

        Ok(())
    }

    /// Resets the pending notification count.
    fn clear(&self) {
        let mut count = [0u8; 8];
        let _ = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &raw mut count as *mut libc::c_void,
                count.len(),
            )
        };
    }
}

impl AsRawFd for Shutdown {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// `signal_fd` receiving SIGINT, SIGTERM and SIGUSR1 instead of their default
/// handlers.
#[derive(Debug)]
struct Signals {
    fd: OwnedFd,
}

impl Signals {
    fn new() -> Result<Self> {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();

            // Initialize the signal set, excluding all signals.
            if libc::sigemptyset(&raw mut mask) == -1 {
                return Err(errno!("failed to initialize signal set"));
            }

            if libc::sigaddset(&raw mut mask, libc::SIGINT) == -1
                || libc::sigaddset(&raw mut mask, libc::SIGTERM) == -1
                || libc::sigaddset(&raw mut mask, libc::SIGUSR1) == -1
            {
                return Err(errno!("failed to update signal set"));
            }

            // Blocks the signals from being intercepted by default handlers.
            if libc::sigprocmask(libc::SIG_BLOCK, &raw const mask, ptr::null_mut()) == -1 {
                return Err(errno!("failed to block signals on signal set"));
            }

            let fd = libc::signalfd(-1, &raw const mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd == -1 {
                return Err(errno!("failed to create signal_fd"));
            }

            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    /// Returns the next pending signal number, if any.
    fn next(&self) -> Result<Option<i32>> {
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };

        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &raw mut info as *mut libc::c_void,
                mem::size_of::<libc::signalfd_siginfo>(),
            )
        };

        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(errno!("failed to read from signal_fd"));
        }

        Ok(Some(info.ssi_signo as i32))
    }
}

/// Epoll instance watching a fixed set of file descriptors for readability.
#[derive(Debug)]
struct Poller {
    fd: OwnedFd,
}

impl Poller {
    fn new() -> Result<Self> {
        // `epoll()` is used to block on all endpoints at once, processing
        // only the file descriptors that are ready for I/O.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(errno!("failed to create epoll_fd"));
        }

        Ok(Self {
            // SAFETY: `fd` was just created and is owned by nothing else.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds `fd` to the interest list, reporting readiness with `token`.
    fn add(&self, fd: RawFd, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };

        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &raw mut ev) }
            == -1
        {
            return Err(errno!("failed to add to epoll interest list"));
        }

        Ok(())
    }

    /// Waits up to `timeout_ms` for readiness, returning the number of events
    /// written to `events`.
    fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n == -1 {
            return Err(errno!("failed to wait on epoll"));
        }

        Ok(n as usize)
    }

    /// Like [Poller::wait], but a failed wait is logged and replaced by
    /// sleeping for `timeout_ms`, reporting no events. Keeps a persistent
    /// failure from spinning the loop.
    fn wait_or_sleep(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> usize {
        match self.wait(events, timeout_ms) {
            Ok(ready) => ready,
            Err(err) => {
                warn!("{err}");
                thread::sleep(Duration::from_millis(timeout_ms.max(0) as u64));
                0
            }
        }
    }
}

/// A point-to-point tunnel between a local device `I` and a transport `N`
/// connected to the remote peer.
///
/// Frames read from the device are framed with the configured release window
/// and sent to the peer immediately. Datagrams from the peer wait in the
/// [Scheduler] and are written to the device once their window opens.
pub struct Tunnel<I, N> {
    dev: Rc<I>,
    net: N,
    delays: Delays,
    scheduler: Scheduler,
    poller: Poller,
    shutdown: Shutdown,
    signals: Option<Signals>,
    stats: Stats,
    buf: Vec<u8>,
}

impl<I, N> Tunnel<I, N>
where
    I: Endpoint + AsRawFd + 'static,
    N: Endpoint + AsRawFd,
{
    /// Creates a tunnel stamping outbound frames with `delays`.
    ///
    /// # Notes
    ///
    /// It is the caller's responsibility to ensure both endpoints are set to
    /// non-blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the epoll instance or the shutdown notifier could
    /// not be created.
    pub fn new(dev: I, net: N, delays: Delays) -> Result<Self> {
        let poller = Poller::new()?;
        let shutdown = Shutdown::new()?;

        poller.add(dev.as_raw_fd(), DEV_TOKEN)?;
        poller.add(net.as_raw_fd(), NET_TOKEN)?;
        poller.add(shutdown.as_raw_fd(), SHUTDOWN_TOKEN)?;

        Ok(Self {
            dev: Rc::new(dev),
            net,
            delays,
            scheduler: Scheduler::new(),
            poller,
            shutdown,
            signals: None,
            stats: Stats::default(),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Routes SIGINT and SIGTERM to a graceful shutdown and SIGUSR1 to a
    /// statistics report, instead of their default handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if the signals could not be blocked or the
    /// `signal_fd` could not be created.
    pub fn catch_signals(mut self) -> Result<Self> {
        let signals = Signals::new()?;
        self.poller.add(signals.fd.as_raw_fd(), SIGNAL_TOKEN)?;
        self.signals = Some(signals);

        Ok(self)
    }

    /// Returns a handle that stops the tunnel from any thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Returns the local device.
    pub fn dev(&self) -> &I {
        &self.dev
    }

    /// Returns the transport connected to the peer.
    pub fn net(&self) -> &N {
        &self.net
    }

    /// Returns the current traffic counters.
    pub fn stats(&self) -> Stats {
        Stats {
            queued: self.scheduler.len(),
            delivery: self.scheduler.counters(),
            ..self.stats
        }
    }

    /// Runs the event loop until a shutdown is requested or an endpoint fails.
    ///
    /// Packets still queued when the loop stops are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing either endpoint fails with a
    /// non-transient error.
    pub fn run(&mut self) -> Result<()> {
        debug!(tick_ms = TICK_MS, delays = ?self.delays, "entering event loop");

        while self.tick()?.is_continue() {}

        let discarded = self.scheduler.clear();
        info!("shutting down, discarded {discarded} queued packets ({})", self.stats());

        Ok(())
    }

    fn tick(&mut self) -> Result<ControlFlow<()>> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EPOLL_MAX_EVENTS];

        let ready = self.poller.wait_or_sleep(&mut events, TICK_MS);

        let mut dev_ready = false;
        let mut net_ready = false;
        let mut signaled = false;
        let mut stopped = false;

        for event in events.iter().take(ready) {
            let token = event.u64;
            match token {
                DEV_TOKEN => dev_ready = true,
                NET_TOKEN => net_ready = true,
                SIGNAL_TOKEN => signaled = true,
                SHUTDOWN_TOKEN => stopped = true,
                _ => {}
            }
        }

        // Egress before ingress, and both before the queue is drained.
        if dev_ready {
            self.forward()?;
        }

        if net_ready {
            self.receive()?;
        }

        self.scheduler.drain_ready(epoch_millis())?;

        if signaled && self.handle_signals()?.is_break() {
            return Ok(ControlFlow::Break(()));
        }

        if stopped {
            self.shutdown.clear();
            info!("shutdown requested");
            return Ok(ControlFlow::Break(()));
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Sends one frame from the device to the peer.
    fn forward(&mut self) -> Result<()> {
        let nbytes = match self.dev.recv(&mut self.buf) {
            Ok(nbytes) => nbytes,
            Err(err) if err.is_transient() => {
                trace!("spurious device readiness: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let datagram = header::encode(&self.buf[..nbytes], &self.delays, epoch_millis());

        match self.net.send(&datagram) {
            Ok(_) => self.stats.forwarded += 1,
            Err(err) if err.is_transient() => {
                warn!("failed to send frame to peer: {err}");
                self.stats.unsent += 1;
            }
            Err(err) => return Err(err),
        }

        Ok(())
    }

    /// Schedules one datagram from the peer for delivery to the device.
    fn receive(&mut self) -> Result<()> {
        let nbytes = match self.net.recv(&mut self.buf) {
            Ok(nbytes) => nbytes,
            Err(err) if err.is_transient() => {
                trace!("spurious peer readiness: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match Packet::decode(self.buf[..nbytes].to_vec()) {
            Ok(packet) => {
                self.stats.received += 1;
                let dev: Rc<dyn Endpoint> = self.dev.clone();
                self.scheduler.enqueue(packet, dev);
            }
            Err(err) => {
                self.stats.rejected += 1;
                debug!("discarding datagram from peer: {err}");
            }
        }

        Ok(())
    }

    fn handle_signals(&self) -> Result<ControlFlow<()>> {
        let Some(signals) = &self.signals else {
            return Ok(ControlFlow::Continue(()));
        };

        let mut flow = ControlFlow::Continue(());

        while let Some(signo) = signals.next()? {
            match signo {
                libc::SIGUSR1 => info!("stats: {}", self.stats()),
                libc::SIGINT | libc::SIGTERM => {
                    info!("signal {signo} caught");
                    flow = ControlFlow::Break(());
                }
                _ => {}
            }
        }

        Ok(flow)
    }
}

impl<I: fmt::Debug, N: fmt::Debug> fmt::Debug for Tunnel<I, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("dev", &self.dev)
            .field("net", &self.net)
            .field("delays", &self.delays)
            .field("queued", &self.scheduler.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
