//! CSV output format
//!
//! Stream rows first, then a blank line, then datagram rows with their
//! success rate and lost segment count.

use std::fs;
use std::path::Path;

use crate::protocol::Transport;
use crate::stats::Summary;

const STREAM_HEADER: &str = "TCP_Connection,File_Size,Elapsed_Time_s,Speed_bps\n";
const DATAGRAM_HEADER: &str =
    "UDP_Connection,File_Size,Elapsed_Time_s,Speed_bps,Success_Rate_%,Lost_Packets\n";

/// Output one round as CSV
pub fn output_csv(summary: &Summary) -> String {
    let mut output = String::new();

    output.push_str(STREAM_HEADER);
    for record in summary.records_for(Transport::Stream) {
        output.push_str(&format!(
            "{},{},{:.6},{:.6}\n",
            record.session,
            record.requested_bytes,
            record.duration_secs,
            record.throughput * 8.0,
        ));
    }

    output.push('\n');

    output.push_str(DATAGRAM_HEADER);
    for record in summary.records_for(Transport::Datagram) {
        let success = record
            .loss
            .map(|loss| format!("{:.2}", (1.0 - loss) * 100.0))
            .unwrap_or_else(|| "N/A".to_string());
        let lost = record
            .lost_segments()
            .map(|lost| lost.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        output.push_str(&format!(
            "{},{},{:.6},{:.6},{},{}\n",
            record.session,
            record.requested_bytes,
            record.duration_secs,
            record.throughput * 8.0,
            success,
            lost,
        ));
    }

    output
}

/// Write every round, separated by blank lines
pub fn save_csv(summaries: &[Summary], path: &Path) -> anyhow::Result<()> {
    let csv = summaries
        .iter()
        .map(output_csv)
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path, csv)?;
    Ok(())
}
