//! Plain text output

use crate::protocol::Transport;
use crate::stats::{Summary, TransportSummary, bytes_to_human, rate_to_human};

pub fn output_plain(summary: &Summary) -> String {
    let mut output = String::new();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str(&format!(
        "  lanspeed round {}\n",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    for transport in [Transport::Stream, Transport::Datagram] {
        let totals = match transport {
            Transport::Stream => &summary.stream,
            Transport::Datagram => &summary.datagram,
        };
        if totals.sessions == 0 {
            continue;
        }
        push_totals(&mut output, transport, totals);

        for record in summary.records_for(transport) {
            output.push_str(&format!("    [{}] ", record.session));
            if let Some(ref error) = record.error {
                output.push_str(&format!("failed: {}\n", error));
                continue;
            }
            output.push_str(&format!(
                "{} in {:.3}s @ {}",
                bytes_to_human(record.bytes),
                record.duration_secs,
                rate_to_human(record.throughput)
            ));
            if let (Some(received), Some(total)) = (record.segments_received, record.total_segments) {
                output.push_str(&format!("  segments: {}/{}", received, total));
            }
            if !record.complete {
                output.push_str("  (incomplete)");
            }
            output.push('\n');
        }
        output.push('\n');
    }

    if let Some(loss) = summary.loss {
        output.push_str(&format!("  Datagram loss: {:.2}%\n", loss * 100.0));
        output.push('\n');
    }

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}

fn push_totals(output: &mut String, transport: Transport, totals: &TransportSummary) {
    output.push_str(&format!("  {} ({} sessions):\n", transport, totals.sessions));
    output.push_str(&format!("    Transfer:    {}\n", bytes_to_human(totals.bytes)));
    output.push_str(&format!("    Avg time:    {:.3}s\n", totals.avg_duration_secs));
    output.push_str(&format!(
        "    Throughput:  {} total, {} per session\n",
        rate_to_human(totals.aggregate_throughput),
        rate_to_human(totals.avg_throughput)
    ));
    if totals.failed > 0 || totals.incomplete > 0 {
        output.push_str(&format!(
            "    Failed: {}  Incomplete: {}\n",
            totals.failed, totals.incomplete
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Aggregator, SegmentCounts, StatisticsRecord};
    use chrono::Utc;
    use std::time::Duration;

    fn summary() -> Summary {
        let aggregator = Aggregator::new();
        aggregator.append(StatisticsRecord::stream(2048, 2048, Duration::from_millis(10), true));
        aggregator.append(
            StatisticsRecord::datagram(
                4096,
                SegmentCounts {
                    total_segments: Some(4),
                    received: 3,
                    duplicates: 0,
                    bytes: 3072,
                },
                Duration::from_millis(20),
            )
            .with_session(0),
        );
        aggregator.append(
            StatisticsRecord::failed(Transport::Stream, 2048, "connection refused").with_session(1),
        );
        aggregator.into_summary("round".to_string(), Utc::now())
    }

    #[test]
    fn test_plain_mentions_both_transports() {
        let text = output_plain(&summary());
        assert!(text.contains("TCP (2 sessions)"));
        assert!(text.contains("UDP (1 sessions)"));
        assert!(text.contains("segments: 3/4"));
        assert!(text.contains("failed: connection refused"));
        assert!(text.contains("Datagram loss: 25.00%"));
    }

    #[test]
    fn test_csv_layout() {
        let csv = crate::output::output_csv(&summary());
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[0].starts_with("TCP_Connection"));
        assert!(lines[1].starts_with("0,2048,"));
        assert!(lines[2].starts_with("1,2048,"));
        assert_eq!(lines[3], "");
        assert!(lines[4].starts_with("UDP_Connection"));
        assert!(lines[5].ends_with(",75.00,1"));
    }

    #[test]
    fn test_json_has_records() {
        let json = crate::output::output_json(&summary());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 3);
        assert_eq!(value["stream"]["failed"], 1);
    }
}
