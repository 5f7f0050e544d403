use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::Transport;

/// Durations are clamped to this before dividing, so a transfer that finishes
/// within one clock tick still gets a finite throughput.
pub const MIN_DURATION: Duration = Duration::from_micros(1);

fn clamped_secs(elapsed: Duration) -> f64 {
    elapsed.max(MIN_DURATION).as_secs_f64()
}

/// Segment bookkeeping of one datagram session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentCounts {
    pub total_segments: Option<u64>,
    pub received: u64,
    pub duplicates: u64,
    pub bytes: u64,
}

/// Result of a single transfer session, produced by its worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub session: u32,
    pub transport: Transport,
    pub requested_bytes: u64,
    pub bytes: u64,
    pub duration_secs: f64,
    /// Bytes per second
    pub throughput: f64,
    /// False when the peer went away before the requested size arrived
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_segments: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<u64>,
    /// Fraction of segments that never arrived, in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatisticsRecord {
    pub fn stream(requested_bytes: u64, bytes: u64, elapsed: Duration, complete: bool) -> Self {
        let secs = clamped_secs(elapsed);
        Self {
            session: 0,
            transport: Transport::Stream,
            requested_bytes,
            bytes,
            duration_secs: secs,
            throughput: bytes as f64 / secs,
            complete,
            total_segments: None,
            segments_received: None,
            duplicates: None,
            loss: None,
            error: None,
        }
    }

    pub fn datagram(requested_bytes: u64, counts: SegmentCounts, elapsed: Duration) -> Self {
        let secs = clamped_secs(elapsed);
        let loss = counts.total_segments.map(|total| {
            if total == 0 {
                0.0
            } else {
                1.0 - (counts.received.min(total) as f64 / total as f64)
            }
        });
        let complete = match counts.total_segments {
            Some(total) => counts.received >= total,
            None => requested_bytes == 0,
        };

        Self {
            session: 0,
            transport: Transport::Datagram,
            requested_bytes,
            bytes: counts.bytes,
            duration_secs: secs,
            throughput: counts.bytes as f64 / secs,
            complete,
            total_segments: counts.total_segments,
            segments_received: Some(counts.received),
            duplicates: Some(counts.duplicates),
            loss,
            error: None,
        }
    }

    /// A session that never got to transfer anything
    pub fn failed(transport: Transport, requested_bytes: u64, error: impl std::fmt::Display) -> Self {
        Self {
            session: 0,
            transport,
            requested_bytes,
            bytes: 0,
            duration_secs: 0.0,
            throughput: 0.0,
            complete: false,
            total_segments: None,
            segments_received: None,
            duplicates: None,
            loss: None,
            error: Some(error.to_string()),
        }
    }

    pub fn with_session(mut self, session: u32) -> Self {
        self.session = session;
        self
    }

    pub fn lost_segments(&self) -> Option<u64> {
        match (self.total_segments, self.segments_received) {
            (Some(total), Some(received)) => Some(total.saturating_sub(received)),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Totals for one transport within a round
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSummary {
    pub sessions: usize,
    pub failed: usize,
    pub incomplete: usize,
    pub requested_bytes: u64,
    pub bytes: u64,
    pub avg_duration_secs: f64,
    /// Mean of per-session throughput, bytes per second
    pub avg_throughput: f64,
    /// Sum of per-session throughput, bytes per second
    pub aggregate_throughput: f64,
}

impl TransportSummary {
    fn from_records<'a>(records: impl Iterator<Item = &'a StatisticsRecord>) -> Self {
        let mut summary = Self::default();
        let mut measured = 0usize;
        let mut duration_sum = 0.0;

        for record in records {
            summary.sessions += 1;
            summary.requested_bytes += record.requested_bytes;
            if record.is_failed() {
                summary.failed += 1;
                continue;
            }
            if !record.complete {
                summary.incomplete += 1;
            }
            measured += 1;
            summary.bytes += record.bytes;
            duration_sum += record.duration_secs;
            summary.aggregate_throughput += record.throughput;
        }

        if measured > 0 {
            summary.avg_duration_secs = duration_sum / measured as f64;
            summary.avg_throughput = summary.aggregate_throughput / measured as f64;
        }
        summary
    }
}

/// Immutable snapshot of one test round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub stream: TransportSummary,
    pub datagram: TransportSummary,
    /// Lost segments over all datagram sessions that learned their segment count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    pub records: Vec<StatisticsRecord>,
}

impl Summary {
    pub fn records_for(&self, transport: Transport) -> impl Iterator<Item = &StatisticsRecord> {
        self.records.iter().filter(move |r| r.transport == transport)
    }
}

/// Collects records from concurrently running workers.
///
/// Workers hold it behind an `Arc` and call [`Aggregator::append`]; the round
/// owner turns it into a [`Summary`] once every worker has been joined and the
/// `Arc` is unique again.
#[derive(Debug, Default)]
pub struct Aggregator {
    records: Mutex<Vec<StatisticsRecord>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: StatisticsRecord) {
        self.records.lock().push(record);
    }

    pub fn into_summary(self, id: String, started_at: DateTime<Utc>) -> Summary {
        let mut records = self.records.into_inner();
        records.sort_by_key(|r| (r.transport, r.session));

        let stream =
            TransportSummary::from_records(records.iter().filter(|r| r.transport == Transport::Stream));
        let datagram = TransportSummary::from_records(
            records.iter().filter(|r| r.transport == Transport::Datagram),
        );

        let (received, total) = records
            .iter()
            .filter_map(|r| match (r.segments_received, r.total_segments) {
                (Some(received), Some(total)) if total > 0 => Some((received.min(total), total)),
                _ => None,
            })
            .fold((0u64, 0u64), |(rx, tot), (r, t)| (rx + r, tot + t));
        let loss = (total > 0).then(|| 1.0 - received as f64 / total as f64);

        Summary {
            id,
            started_at,
            stream,
            datagram,
            loss,
            records,
        }
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a bytes-per-second rate as bits per second
pub fn rate_to_human(bytes_per_sec: f64) -> String {
    let mbps = bytes_per_sec * 8.0 / 1_000_000.0;
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.1} Mbps", mbps)
    } else {
        format!("{:.1} Kbps", mbps * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_duration_is_clamped() {
        let record = StatisticsRecord::stream(100, 100, Duration::ZERO, true);
        assert_eq!(record.duration_secs, MIN_DURATION.as_secs_f64());
        assert!(record.throughput.is_finite());
        assert!(record.throughput > 0.0);
    }

    #[test]
    fn test_datagram_loss() {
        let counts = SegmentCounts {
            total_segments: Some(4),
            received: 3,
            duplicates: 1,
            bytes: 3072,
        };
        let record = StatisticsRecord::datagram(4096, counts, Duration::from_millis(10));
        assert_eq!(record.loss, Some(0.25));
        assert_eq!(record.lost_segments(), Some(1));
        assert!(!record.complete);
    }

    #[test]
    fn test_datagram_without_segments_has_no_loss() {
        let record =
            StatisticsRecord::datagram(4096, SegmentCounts::default(), Duration::from_secs(1));
        assert_eq!(record.loss, None);
        assert_eq!(record.bytes, 0);
        assert!(!record.complete);
    }

    #[test]
    fn test_summary_totals() {
        let aggregator = Aggregator::new();
        aggregator.append(
            StatisticsRecord::stream(2048, 2048, Duration::from_secs(1), true).with_session(1),
        );
        aggregator.append(
            StatisticsRecord::stream(2048, 1024, Duration::from_secs(1), false).with_session(0),
        );
        aggregator.append(StatisticsRecord::datagram(
            4096,
            SegmentCounts {
                total_segments: Some(4),
                received: 2,
                duplicates: 0,
                bytes: 2048,
            },
            Duration::from_secs(2),
        ));
        aggregator.append(StatisticsRecord::failed(
            Transport::Datagram,
            4096,
            "connection refused",
        ));

        let summary = aggregator.into_summary("round".to_string(), Utc::now());
        assert_eq!(summary.records.len(), 4);
        assert_eq!(summary.records[0].session, 0);
        assert_eq!(summary.stream.sessions, 2);
        assert_eq!(summary.stream.bytes, 3072);
        assert_eq!(summary.stream.incomplete, 1);
        assert_eq!(summary.stream.aggregate_throughput, 3072.0);
        assert_eq!(summary.stream.avg_throughput, 1536.0);
        assert_eq!(summary.datagram.sessions, 2);
        assert_eq!(summary.datagram.failed, 1);
        assert_eq!(summary.datagram.avg_duration_secs, 2.0);
        assert_eq!(summary.loss, Some(0.5));
    }

    #[test]
    fn test_concurrent_append() {
        let aggregator = Arc::new(Aggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let aggregator = aggregator.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        aggregator.append(
                            StatisticsRecord::stream(10, 10, Duration::from_millis(1), true)
                                .with_session(i),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let aggregator = Arc::try_unwrap(aggregator).expect("all workers joined");
        let summary = aggregator.into_summary("r".to_string(), Utc::now());
        assert_eq!(summary.records.len(), 800);
        assert_eq!(summary.stream.bytes, 8000);
    }

    #[test]
    fn test_bytes_to_human() {
        assert_eq!(bytes_to_human(500), "500 B");
        assert_eq!(bytes_to_human(1024), "1.00 KB");
        assert_eq!(bytes_to_human(1024 * 1024), "1.00 MB");
        assert_eq!(bytes_to_human(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_rate_to_human() {
        assert_eq!(rate_to_human(62_500_000.0), "500.0 Mbps");
        assert_eq!(rate_to_human(187_500_000.0), "1.50 Gbps");
        assert_eq!(rate_to_human(1_000.0), "8.0 Kbps");
    }
}
