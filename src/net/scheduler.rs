//! Delivery scheduler holding inbound packets until their release window
//! opens.
//!
//! The queue is a flat sequence in arrival order. Every tick scans the whole
//! queue since entries are not ordered by time: a later entry may have a
//! shorter window than the ones before it.

use std::collections::VecDeque;
use std::rc::Rc;

use rand::Rng;
use tracing::{trace, warn};

use crate::Result;
use crate::net::Endpoint;
use crate::net::header::PacketHeader;

/// A datagram received from the peer whose header passed validation.
///
/// Owns the whole datagram buffer (header and payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    buf: Vec<u8>,
}

impl Packet {
    /// Takes ownership of a received datagram and validates its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is shorter than the header or carries
    /// a different protocol version.
    pub fn decode(buf: Vec<u8>) -> Result<Self> {
        let header = PacketHeader::try_from(&buf[..])?;

        Ok(Self { header, buf })
    }

    /// Returns the validated header of the packet.
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Returns the payload that follows the header.
    pub fn payload(&self) -> &[u8] {
        &self.buf[PacketHeader::LEN..]
    }

    /// Returns the length of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - PacketHeader::LEN
    }
}

/// A packet waiting in the [Scheduler] together with the endpoint it must
/// eventually be written to.
#[derive(Debug)]
pub struct QueueEntry {
    packet: Packet,
    release_at: u64,
    dev: Rc<dyn Endpoint>,
}

impl QueueEntry {
    /// Returns the queued packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Returns the time, in epoch milliseconds, after which the packet is
    /// released. Equal to the header's min time unless jitter was applied.
    pub fn release_at(&self) -> u64 {
        self.release_at
    }

    fn is_expired(&self, now: u64) -> bool {
        let max_time = self.packet.header.max_time();
        max_time != 0 && max_time < now
    }

    fn is_ready(&self, now: u64) -> bool {
        self.release_at < now
    }
}

/// Per-scheduler delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Packets written to their destination.
    pub sent: u64,
    /// Packets discarded because their deadline passed.
    pub dropped: u64,
    /// Packets whose write to the destination failed.
    pub failed: u64,
}

/// Queue of decoded packets waiting for their release window.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<QueueEntry>,
    counters: Counters,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `packet` to the tail of the queue, to be written to `dev` once
    /// its release window opens.
    ///
    /// A packet with both a min time and a jitter width is released at a
    /// uniformly random time in `[min_time, min_time + jitter]`.
    pub fn enqueue(&mut self, packet: Packet, dev: Rc<dyn Endpoint>) {
        let release_at = release_time(packet.header());

        trace!(
            release_at,
            max_time = packet.header().max_time(),
            len = packet.payload_len(),
            "scheduling packet"
        );

        self.queue.push_back(QueueEntry {
            packet,
            release_at,
            dev,
        });
    }

    /// Releases every queued packet whose window opened before `now` and
    /// drops every packet whose deadline passed before `now`.
    ///
    /// Drop takes precedence over release. Entries that are neither stay
    /// queued and the scan continues to the end of the queue.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient write failure. The failed packet is
    /// removed; entries not yet visited stay queued for the next call.
    /// Transient failures are logged and counted.
    pub fn drain_ready(&mut self, now: u64) -> Result<()> {
        let counters = &mut self.counters;
        let mut fatal = None;

        self.queue.retain(|entry| {
            if fatal.is_some() {
                return true;
            }

            if entry.is_expired(now) {
                trace!(
                    max_time = entry.packet.header.max_time(),
                    now, "packet too old, discarding"
                );
                counters.dropped += 1;
                return false;
            }

            if !entry.is_ready(now) {
                return true;
            }

            match entry.dev.send(entry.packet.payload()) {
                Ok(_) => counters.sent += 1,
                Err(err) if err.is_transient() => {
                    warn!("failed to release packet to {:?}: {err}", entry.dev);
                    counters.failed += 1;
                }
                Err(err) => {
                    counters.failed += 1;
                    fatal = Some(err);
                }
            }

            false
        });

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Discards every queued packet, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        discarded
    }

    /// Returns the number of queued packets.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no packets are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns an iterator over the queued entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.queue.iter()
    }

    /// Returns the delivery counters.
    pub fn counters(&self) -> Counters {
        self.counters
    }
}

fn release_time(header: &PacketHeader) -> u64 {
    let min_time = header.min_time();

    // Without a min time there is no window to spread the packet over.
    if min_time == 0 || header.jitter() == 0 {
        return min_time;
    }

    min_time.saturating_add(rand::rng().random_range(0..=header.jitter()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::header::PROTOCOL_VERSION;
    use crate::{Error, ParseError};

    use std::cell::RefCell;
    use std::io;

    #[derive(Debug, Default)]
    struct Sink {
        sent: RefCell<Vec<Vec<u8>>>,
        fail: Option<fn() -> io::Error>,
    }

    impl Sink {
        fn failing(fail: fn() -> io::Error) -> Self {
            Self {
                sent: Default::default(),
                fail: Some(fail),
            }
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.borrow().clone()
        }
    }

    impl Endpoint for Sink {
        fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock).into())
        }

        fn send(&self, buf: &[u8]) -> Result<usize> {
            if let Some(fail) = self.fail {
                return Err(fail().into());
            }

            self.sent.borrow_mut().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    fn packet(min_time: u64, max_time: u64, jitter: u64, payload: &[u8]) -> Packet {
        let mut buf = vec![PROTOCOL_VERSION];
        buf.extend_from_slice(&min_time.to_be_bytes());
        buf.extend_from_slice(&max_time.to_be_bytes());
        buf.extend_from_slice(&jitter.to_be_bytes());
        buf.extend_from_slice(payload);

        Packet::decode(buf).unwrap()
    }

    #[test]
    fn packet_decode_owns_payload() {
        let packet = packet(10, 20, 0, b"hello");

        assert_eq!(packet.header().min_time(), 10);
        assert_eq!(packet.header().max_time(), 20);
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(packet.payload_len(), 5);
    }

    #[test]
    fn packet_decode_rejects_foreign_version() {
        let mut buf = packet(10, 20, 0, b"hello").buf;
        buf[0] = PROTOCOL_VERSION.wrapping_add(1);

        assert!(matches!(
            Packet::decode(buf),
            Err(Error::Parse(ParseError::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn drain_empty_queue_is_noop() {
        let mut scheduler = Scheduler::new();

        scheduler.drain_ready(1_000).unwrap();

        assert!(scheduler.is_empty());
        assert_eq!(scheduler.counters(), Counters::default());
    }

    #[test]
    fn packet_held_until_min_time() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(1_010, 0, 0, b"late"), sink.clone());

        scheduler.drain_ready(1_005).unwrap();
        assert_eq!(scheduler.len(), 1);
        assert!(sink.sent().is_empty());

        scheduler.drain_ready(1_012).unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(sink.sent(), vec![b"late".to_vec()]);

        // Released at most once.
        scheduler.drain_ready(2_000).unwrap();
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(scheduler.counters().sent, 1);
        assert_eq!(scheduler.counters().dropped, 0);
    }

    #[test]
    fn release_requires_strictly_later_time() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(1_010, 0, 0, b"edge"), sink.clone());

        scheduler.drain_ready(1_010).unwrap();
        assert_eq!(scheduler.len(), 1);

        scheduler.drain_ready(1_011).unwrap();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn deadline_before_min_time_is_dropped() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(1_010, 1_008, 0, b"stale"), sink.clone());

        scheduler.drain_ready(1_009).unwrap();
        assert!(scheduler.is_empty());
        assert!(sink.sent().is_empty());
        assert_eq!(scheduler.counters().dropped, 1);
        assert_eq!(scheduler.counters().sent, 0);
    }

    #[test]
    fn drop_takes_precedence_over_release() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        // Both conditions hold at the same scan.
        scheduler.enqueue(packet(1_000, 1_500, 0, b"expired"), sink.clone());

        scheduler.drain_ready(2_000).unwrap();
        assert!(sink.sent().is_empty());
        assert_eq!(scheduler.counters().dropped, 1);
    }

    #[test]
    fn zero_deadline_never_expires() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(1_000, 0, 0, b"forever"), sink.clone());

        scheduler.drain_ready(u64::MAX).unwrap();
        assert_eq!(sink.sent(), vec![b"forever".to_vec()]);
        assert_eq!(scheduler.counters().dropped, 0);
    }

    #[test]
    fn zero_min_time_released_on_next_drain() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(0, 5_000, 0, b"now"), sink.clone());

        scheduler.drain_ready(1_000).unwrap();
        assert_eq!(sink.sent(), vec![b"now".to_vec()]);
    }

    #[test]
    fn scan_visits_entries_after_held_ones() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(5_000, 0, 0, b"held"), sink.clone());
        scheduler.enqueue(packet(900, 0, 0, b"ready"), sink.clone());
        scheduler.enqueue(packet(4_000, 950, 0, b"expired"), sink.clone());
        scheduler.enqueue(packet(800, 0, 0, b"also ready"), sink.clone());

        scheduler.drain_ready(1_000).unwrap();

        assert_eq!(sink.sent(), vec![b"ready".to_vec(), b"also ready".to_vec()]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.iter().next().unwrap().packet().payload(), b"held");
        assert_eq!(
            scheduler.counters(),
            Counters {
                sent: 2,
                dropped: 1,
                failed: 0,
            }
        );
    }

    #[test]
    fn jitter_stays_within_window() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        for _ in 0..64 {
            scheduler.enqueue(packet(1_000, 0, 50, b"jittered"), sink.clone());
        }

        for entry in scheduler.iter() {
            assert!((1_000..=1_050).contains(&entry.release_at()));
        }

        scheduler.drain_ready(1_000).unwrap();
        assert_eq!(scheduler.len(), 64);

        scheduler.drain_ready(1_051).unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(sink.sent().len(), 64);
    }

    #[test]
    fn jitter_ignored_without_min_time() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(0, 0, 50, b"no anchor"), sink);

        assert_eq!(scheduler.iter().next().unwrap().release_at(), 0);
    }

    #[test]
    fn transient_write_failure_is_counted() {
        let sink = Rc::new(Sink::failing(|| io::ErrorKind::WouldBlock.into()));
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(10, 0, 0, b"a"), sink.clone());
        scheduler.enqueue(packet(10, 0, 0, b"b"), sink);

        scheduler.drain_ready(1_000).unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.counters().failed, 2);
        assert_eq!(scheduler.counters().sent, 0);
    }

    #[test]
    fn refused_frame_does_not_stop_drain() {
        let refusing = Rc::new(Sink::failing(|| io::Error::from_raw_os_error(libc::EINVAL)));
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        // An empty payload is not a valid frame for the device.
        scheduler.enqueue(packet(10, 0, 0, b""), refusing);
        scheduler.enqueue(packet(10, 0, 0, b"next"), sink.clone());

        scheduler.drain_ready(1_000).unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(sink.sent(), vec![b"next".to_vec()]);
        assert_eq!(
            scheduler.counters(),
            Counters {
                sent: 1,
                dropped: 0,
                failed: 1,
            }
        );
    }

    #[test]
    fn fatal_write_failure_is_propagated() {
        let broken = Rc::new(Sink::failing(|| io::ErrorKind::BrokenPipe.into()));
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(10, 0, 0, b"a"), broken);
        scheduler.enqueue(packet(10, 0, 0, b"b"), sink.clone());

        let err = scheduler.drain_ready(1_000).unwrap_err();
        assert!(!err.is_transient());

        // The failed packet is gone, the rest waits for the next tick.
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.counters().failed, 1);

        scheduler.drain_ready(1_000).unwrap();
        assert_eq!(sink.sent(), vec![b"b".to_vec()]);
    }

    #[test]
    fn clear_discards_queue() {
        let sink = Rc::new(Sink::default());
        let mut scheduler = Scheduler::new();

        scheduler.enqueue(packet(5_000, 0, 0, b"a"), sink.clone());
        scheduler.enqueue(packet(5_000, 0, 0, b"b"), sink.clone());

        assert_eq!(scheduler.clear(), 2);
        assert!(scheduler.is_empty());

        scheduler.drain_ready(10_000).unwrap();
        assert!(sink.sent().is_empty());
    }
}
