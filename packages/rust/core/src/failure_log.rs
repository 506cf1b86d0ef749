//! Append-only log of URLs that produced no mention, for manual follow-up.
//!
//! One block per run:
//!
//! ```text
//! === Failed URLs - 2024-05-01 12:00:00 UTC ===
//! URL: https://news.example/a
//! Status: http-error
//! Reason: HTTP 404: https://news.example/a
//! ---
//! ```

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use harvester_shared::{FailedUrl, HarvestError, Result};

/// Render one run's block.
pub fn format_block(failures: &[FailedUrl], at: DateTime<Utc>) -> String {
    let mut block = format!("=== Failed URLs - {} ===\n", at.format("%Y-%m-%d %H:%M:%S UTC"));
    for failure in failures {
        // Writing to a String cannot fail.
        let _ = writeln!(block, "URL: {}", failure.url);
        let _ = writeln!(block, "Status: {}", failure.reason);
        let _ = writeln!(block, "Reason: {}", failure.detail.replace('\n', " "));
        block.push_str("---\n");
    }
    block.push('\n');
    block
}

/// Append a block for `failures` to `path`, creating parent directories.
/// Nothing is written when there are no failures.
pub fn append(path: &Path, failures: &[FailedUrl]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| HarvestError::io(path, e))?;
    file.write_all(format_block(failures, Utc::now()).as_bytes())
        .map_err(|e| HarvestError::io(path, e))?;

    info!(path = %path.display(), count = failures.len(), "failed URLs logged");
    Ok(())
}
