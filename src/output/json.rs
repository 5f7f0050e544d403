//! JSON output

use std::fs;
use std::path::Path;

use crate::stats::Summary;

pub fn output_json(summary: &Summary) -> String {
    serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string())
}

/// Write every round as one JSON array
pub fn save_json(summaries: &[Summary], path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(summaries)?;
    fs::write(path, json)?;
    Ok(())
}
