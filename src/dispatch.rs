//! Dispatch Pipeline
//!
//! Reader / worker-pool / writer pipeline with a strict free-list buffer
//! pool per writer.
//!
//! # Design
//!
//! - Per writer: `queue_depth` boxed buffers and two bounded channels of the
//!   same capacity, a free list and a task list
//! - At any instant a buffer is owned by exactly one of free list, in-flight
//!   task, or worker; channel handoff is the synchronization
//! - The free-list send can never block: channel capacity equals the number
//!   of buffers in circulation
//! - No steady-state error is fatal; everything is counted and the relay
//!   keeps forwarding

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::buffer::PacketBuffer;
use crate::selector::Selector;
use crate::stats::DispatchStats;

/// Source of inbound datagrams; the subset of a UDP socket the pipeline
/// needs.
pub trait PacketSource: Send + Sync {
    /// Receive one datagram into `buf`, returning its length and origin.
    ///
    /// Returning `ErrorKind::UnexpectedEof` tells the pipeline the source is
    /// finished; any other error is counted and reading continues.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;
}

impl PacketSource for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let (len, addr) = UdpSocket::recv_from(self, buf)?;
        match addr {
            SocketAddr::V4(v4) => Ok((len, v4)),
            // The relay is IPv4-only; a v6 peer is a read error, not a stop.
            SocketAddr::V6(v6) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ipv6 source {v6}"),
            )),
        }
    }
}

/// Sink for fully built IPv4 frames.
pub trait FrameWriter: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;
}

/// One in-flight datagram travelling from the reader to a worker.
struct Task {
    len: usize,
    src: SocketAddrV4,
    buf: Box<PacketBuffer>,
}

/// Forwards datagrams from a packet source to `dst`, consulting the
/// selector for every packet.
pub struct Dispatcher<S> {
    dst: SocketAddrV4,
    selector: S,
    stats: Arc<DispatchStats>,
}

impl<S: Selector> Dispatcher<S> {
    pub fn new(dst: SocketAddrV4, selector: S, stats: Arc<DispatchStats>) -> Self {
        Self {
            dst,
            selector,
            stats,
        }
    }

    /// Run one pipe per writer and block until every pipe has finished.
    ///
    /// The maximum number of in-flight datagrams is
    /// `writers.len() * queue_depth`. Each pipe runs until the source
    /// reports its EOF-equivalent.
    pub fn listen<P, W>(&self, source: &P, writers: &[W], queue_depth: usize)
    where
        P: PacketSource,
        W: FrameWriter,
    {
        assert!(queue_depth > 0, "queue depth must be nonzero");
        thread::scope(|s| {
            for writer in writers {
                s.spawn(move || self.pipe(source, writer, queue_depth));
            }
        });
    }

    /// Reader half of one pipe: a free buffer admits one read.
    fn pipe<P, W>(&self, source: &P, writer: &W, queue_depth: usize)
    where
        P: PacketSource,
        W: FrameWriter,
    {
        let (free_tx, free_rx) = bounded::<Box<PacketBuffer>>(queue_depth);
        let (task_tx, task_rx) = bounded::<Task>(queue_depth);
        for _ in 0..queue_depth {
            // Cannot fail: capacity equals the number of buffers.
            let _ = free_tx.send(Box::new(PacketBuffer::new()));
        }

        thread::scope(|s| {
            for _ in 0..queue_depth {
                let tasks = task_rx.clone();
                let free = free_tx.clone();
                s.spawn(move || self.worker(tasks, free, writer));
            }

            loop {
                let mut buf = match free_rx.recv() {
                    Ok(buf) => buf,
                    Err(_) => break,
                };
                match source.recv_from(buf.payload_mut()) {
                    Ok((len, src)) => {
                        if task_tx.send(Task { len, src, buf }).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        tracing::debug!("packet source finished");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "udp read failed");
                        self.stats.record_read_error();
                        let _ = free_tx.send(buf);
                    }
                }
            }
            // Closing the task list drains and stops the workers.
            drop(task_tx);
        });
    }

    fn worker<W: FrameWriter>(
        &self,
        tasks: Receiver<Task>,
        free: Sender<Box<PacketBuffer>>,
        writer: &W,
    ) {
        for Task { len, src, mut buf } in tasks {
            let started = Instant::now();
            let forward = match self.selector.select(*src.ip(), &buf.payload()[..len]) {
                Ok(forward) => {
                    if !forward {
                        self.stats.record_reject();
                    }
                    forward
                }
                Err(e) => {
                    // Forward when the payload cannot be inspected.
                    tracing::debug!(error = %e, %src, "cannot inspect datagram, forwarding");
                    self.stats.record_selector_error();
                    true
                }
            };

            if forward {
                let frame = buf.spoof_udp(src, self.dst, len);
                match writer.write_frame(frame) {
                    Ok(_) => self.stats.record_forward(frame.len()),
                    Err(e) => {
                        tracing::warn!(error = %e, "raw socket write failed");
                        self.stats.record_write_error();
                    }
                }
            }

            let _ = free.send(buf);
            self.stats.duration.record(started.elapsed().as_micros() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAYLOAD_OFFSET;
    use crate::error::RelayError;
    use crate::radius::build_packet;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    const DST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 100, 101, 102), 1812);

    fn src_addr() -> SocketAddrV4 {
        "10.1.2.3:3000".parse().unwrap()
    }

    /// Yields queued datagrams, then the EOF-equivalent.
    struct MockSource {
        packets: Mutex<VecDeque<io::Result<(Vec<u8>, SocketAddrV4)>>>,
    }

    impl MockSource {
        fn new(packets: Vec<io::Result<(Vec<u8>, SocketAddrV4)>>) -> Self {
            Self {
                packets: Mutex::new(packets.into()),
            }
        }

        fn of_payloads(payloads: &[&[u8]]) -> Self {
            Self::new(
                payloads
                    .iter()
                    .map(|p| Ok((p.to_vec(), src_addr())))
                    .collect(),
            )
        }
    }

    impl PacketSource for MockSource {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
            match self.packets.lock().pop_front() {
                Some(Ok((payload, src))) => {
                    buf[..payload.len()].copy_from_slice(&payload);
                    Ok((payload.len(), src))
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "drained")),
            }
        }
    }

    #[derive(Default)]
    struct MockWriter {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameWriter for MockWriter {
        fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
            self.frames.lock().push(frame.to_vec());
            Ok(frame.len())
        }
    }

    struct BrokenWriter;

    impl FrameWriter for BrokenWriter {
        fn write_frame(&self, _frame: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no route"))
        }
    }

    /// Forwards everything
    struct Accept;

    impl Selector for Accept {
        fn select(&self, _src: Ipv4Addr, _payload: &[u8]) -> Result<bool, RelayError> {
            Ok(true)
        }
    }

    /// Rejects everything
    struct Deny;

    impl Selector for Deny {
        fn select(&self, _src: Ipv4Addr, _payload: &[u8]) -> Result<bool, RelayError> {
            Ok(false)
        }
    }

    /// Fails on everything, as if every payload were uninspectable
    struct Broken;

    impl Selector for Broken {
        fn select(&self, _src: Ipv4Addr, _payload: &[u8]) -> Result<bool, RelayError> {
            Err(RelayError::TruncatedPacket)
        }
    }

    #[test]
    fn test_forwards_spoofed_frames() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Accept, stats.clone());
        let source = MockSource::of_payloads(&[b"payload 1".as_slice(), b"payload 2"]);
        let writers = [MockWriter::default()];

        dispatcher.listen(&source, &writers, 4);

        let frames = writers[0].frames.lock();
        assert_eq!(frames.len(), 2);
        for frame in frames.iter() {
            assert_eq!(frame.len(), PAYLOAD_OFFSET + 9);
            // Spoofed source survives into the frame.
            assert_eq!(&frame[12..16], &[10, 1, 2, 3]);
            assert!(frame[PAYLOAD_OFFSET..].starts_with(b"payload"));
        }
        assert_eq!(stats.snapshot().forwarded, 2);
    }

    #[test]
    fn test_rejected_packets_are_dropped_and_counted() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Deny, stats.clone());
        let source = MockSource::of_payloads(&[b"a".as_slice(), b"b", b"c"]);
        let writers = [MockWriter::default()];

        dispatcher.listen(&source, &writers, 2);

        assert!(writers[0].frames.lock().is_empty());
        let snap = stats.snapshot();
        assert_eq!(snap.rejects, 3);
        assert_eq!(snap.forwarded, 0);
    }

    #[test]
    fn test_selector_error_forwards_anyway() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Broken, stats.clone());
        let source = MockSource::of_payloads(&[b"not radius".as_slice()]);
        let writers = [MockWriter::default()];

        dispatcher.listen(&source, &writers, 2);

        assert_eq!(writers[0].frames.lock().len(), 1);
        assert_eq!(stats.snapshot().selector_errors, 1);
    }

    #[test]
    fn test_read_errors_do_not_stop_the_pipe() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Accept, stats.clone());
        let source = MockSource::new(vec![
            Err(io::Error::new(io::ErrorKind::Other, "transient")),
            Ok((b"after error".to_vec(), src_addr())),
        ]);
        let writers = [MockWriter::default()];

        dispatcher.listen(&source, &writers, 2);

        assert_eq!(writers[0].frames.lock().len(), 1);
        assert_eq!(stats.snapshot().read_errors, 1);
    }

    #[test]
    fn test_write_errors_are_counted_not_fatal() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Accept, stats.clone());
        let source = MockSource::of_payloads(&[b"a".as_slice(), b"b"]);
        let writers = [BrokenWriter];

        dispatcher.listen(&source, &writers, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.write_errors, 2);
        assert_eq!(snap.forwarded, 0);
    }

    #[test]
    fn test_small_pool_relays_many_packets() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Accept, stats.clone());
        let payloads: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i; 16]).collect();
        let source = MockSource::new(
            payloads
                .iter()
                .map(|p| Ok((p.clone(), src_addr())))
                .collect(),
        );
        let writers = [MockWriter::default()];

        dispatcher.listen(&source, &writers, 2);

        assert_eq!(writers[0].frames.lock().len(), 100);
        assert_eq!(stats.snapshot().forwarded, 100);
    }

    #[test]
    fn test_writers_share_one_source() {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher::new(DST, Accept, stats.clone());
        let payloads: Vec<&[u8]> = (0..50).map(|_| b"x".as_slice()).collect();
        let source = MockSource::of_payloads(&payloads);
        let writers = [MockWriter::default(), MockWriter::default()];

        dispatcher.listen(&source, &writers, 4);

        let total: usize = writers.iter().map(|w| w.frames.lock().len()).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn test_rate_limited_radius_traffic_end_to_end() {
        use crate::cache::fixed_sizer;
        use crate::selector::ShardedSelector;
        use crate::stats::Metrics;
        use std::time::Duration;

        let metrics = Metrics::new();
        let selector = ShardedSelector::new(
            Duration::from_secs(3600),
            5,
            fixed_sizer(2, 4),
            fixed_sizer(100, 100),
            &metrics,
        )
        .unwrap();
        let dispatcher = Dispatcher::new(DST, selector, metrics.dispatch.clone());

        let request = build_packet(1, &[(1, b"alice")]);
        let payloads: Vec<&[u8]> = (0..6).map(|_| request.as_slice()).collect();
        let source = MockSource::of_payloads(&payloads);
        let writers = [MockWriter::default()];

        // Single worker keeps the allow/deny order deterministic.
        dispatcher.listen(&source, &writers, 1);

        assert_eq!(writers[0].frames.lock().len(), 2);
        assert_eq!(metrics.dispatch.snapshot().rejects, 4);
    }
}
