//! Segmented datagram transfers
//!
//! The server slices the requested byte count into numbered segments and sends
//! them without acknowledgement. The client counts distinct segment indices
//! and infers the end of the transfer from silence, since datagrams carry no
//! end-of-stream marker.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::discover::Endpoint;
use crate::net;
use crate::protocol::{PAYLOAD_HEADER_LEN, PayloadHeader, Request};
use crate::shutdown::{self, cancelled};
use crate::stats::{SegmentCounts, StatisticsRecord};

/// Largest datagram we expect to receive
const MAX_DATAGRAM_SIZE: usize = 65536;
const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(1);
const DEFAULT_RECV_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Silence after which the receiver considers the transfer over
    pub idle_window: Duration,
    /// Requested SO_RCVBUF for the receiving socket
    pub recv_buffer_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_window: DEFAULT_IDLE_WINDOW,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
        }
    }
}

/// How a byte count is split into segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    size: u64,
    chunk_size: u64,
    total: u64,
}

impl SegmentPlan {
    pub fn new(size: u64, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1) as u64;
        Self {
            size,
            chunk_size,
            total: size.div_ceil(chunk_size),
        }
    }

    pub fn total_segments(&self) -> u64 {
        self.total
    }

    /// Payload length of segment `index`; only the last one may be short.
    pub fn segment_len(&self, index: u64) -> usize {
        let offset = index.saturating_mul(self.chunk_size);
        self.size.saturating_sub(offset).min(self.chunk_size) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSendStats {
    pub segments_sent: u64,
    pub bytes_sent: u64,
}

/// Send every segment of `size` bytes to `peer`, in index order.
pub async fn send_segments(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    size: u64,
    chunk_size: usize,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<UdpSendStats> {
    let plan = SegmentPlan::new(size, chunk_size);
    let mut packet = vec![0u8; PAYLOAD_HEADER_LEN + chunk_size.max(1)];
    let mut stats = UdpSendStats {
        segments_sent: 0,
        bytes_sent: 0,
    };

    debug!(
        "Sending {} bytes to {} as {} segments",
        size,
        peer,
        plan.total_segments()
    );

    for index in 0..plan.total_segments() {
        if shutdown::is_cancelled(&cancel) {
            debug!("Datagram send to {} cancelled", peer);
            break;
        }

        let header = PayloadHeader {
            total_segments: plan.total_segments(),
            segment_index: index,
        };
        header.encode(&mut packet);
        let payload_len = plan.segment_len(index);

        socket
            .send_to(&packet[..PAYLOAD_HEADER_LEN + payload_len], peer)
            .await?;
        stats.segments_sent += 1;
        stats.bytes_sent += payload_len as u64;
    }

    Ok(stats)
}

/// Receiver-side bookkeeping of which segments arrived
#[derive(Debug, Default)]
pub struct SegmentTracker {
    total: Option<u64>,
    seen: HashSet<u64>,
    duplicates: u64,
    foreign: u64,
    bytes: u64,
}

impl SegmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one segment. Returns false for duplicates and for segments whose
    /// total disagrees with the first one seen.
    pub fn record(&mut self, header: &PayloadHeader, payload_len: usize) -> bool {
        let total = *self.total.get_or_insert(header.total_segments);
        if header.total_segments != total || header.segment_index >= total {
            self.foreign += 1;
            return false;
        }
        if !self.seen.insert(header.segment_index) {
            self.duplicates += 1;
            return false;
        }
        self.bytes += payload_len as u64;
        true
    }

    pub fn total_segments(&self) -> Option<u64> {
        self.total
    }

    pub fn received(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Segments dropped for disagreeing with the first announced total
    pub fn discarded(&self) -> u64 {
        self.foreign
    }

    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.received() >= total)
    }

    pub fn loss_fraction(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                0.0
            } else {
                1.0 - self.received() as f64 / total as f64
            }
        })
    }

    pub fn counts(&self) -> SegmentCounts {
        SegmentCounts {
            total_segments: self.total,
            received: self.received(),
            duplicates: self.duplicates,
            bytes: self.bytes,
        }
    }
}

/// Send one Request and collect the segments that come back.
///
/// Only datagrams from the server's address are counted. Ends when the
/// requested bytes or all announced segments have arrived, or when nothing
/// has been received for `idle_window`. The reported duration
/// runs until the last accepted segment.
pub async fn request_datagram_transfer(
    endpoint: &Endpoint,
    size: u64,
    config: &UdpConfig,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<StatisticsRecord> {
    let remote = endpoint.udp_addr();
    let socket = net::create_udp_socket_for_remote(remote, Some(config.recv_buffer_size)).await?;

    let request = Request {
        requested_size: size,
    }
    .encode();
    let start = Instant::now();
    socket.send_to(&request, remote).await?;

    let mut tracker = SegmentTracker::new();
    let mut last_arrival: Option<Instant> = None;
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    while tracker.bytes() < size && !tracker.is_complete() {
        tokio::select! {
            result = tokio::time::timeout(config.idle_window, socket.recv_from(&mut buffer)) => {
                match result {
                    Err(_) => {
                        debug!(
                            "No datagram from {} for {:?}, ending with {} segments",
                            remote,
                            config.idle_window,
                            tracker.received()
                        );
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!("Datagram receive error from {}: {}", remote, e);
                        break;
                    }
                    Ok(Ok((_, from))) if from.ip() != remote.ip() => {
                        trace!("Ignoring datagram from {}, expecting {}", from, remote.ip());
                    }
                    Ok(Ok((n, from))) => match PayloadHeader::decode(&buffer[..n]) {
                        Ok((header, payload)) => {
                            if tracker.record(&header, payload.len()) {
                                last_arrival = Some(Instant::now());
                            }
                        }
                        Err(e) => trace!("Discarding datagram from {}: {}", from, e),
                    },
                }
            }
            _ = cancelled(&mut cancel) => {
                debug!("Datagram receive from {} cancelled", remote);
                break;
            }
        }
    }

    let elapsed = match last_arrival {
        Some(at) => at.duration_since(start),
        None => start.elapsed(),
    };
    debug!(
        "Datagram transfer from {} finished: {}/{:?} segments, {} bytes, {} discarded",
        remote,
        tracker.received(),
        tracker.total_segments(),
        tracker.bytes(),
        tracker.discarded()
    );
    Ok(StatisticsRecord::datagram(size, tracker.counts(), elapsed))
}
