use crate::artifact::PURGE_LOG_PREFIX;
use crate::error::Result;
use crate::util::{self, BYTES_PER_MB};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const PURGE_LOG_HEADER: &str = "Date\tWorker\tSize_MB\tModify_Date\tPath";

/// Yearly, append-only, tab-delimited audit trail of evicted artifacts.
///
/// Other workers append to the same file concurrently, so each record is a single
/// `write_all` of one line and the file is never read back or rewritten.
#[derive(Clone, Debug)]
pub struct PurgeLog {
    dir: PathBuf,
    worker: String,
}

impl PurgeLog {
    pub fn new(dir: impl Into<PathBuf>, worker: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            worker: worker.into(),
        }
    }

    pub fn path_for(&self, now: SystemTime) -> PathBuf {
        self.dir
            .join(format!("{PURGE_LOG_PREFIX}{}.txt", util::utc_year(now)))
    }

    pub fn record(
        &self,
        now: SystemTime,
        size_bytes: u64,
        modified: Option<SystemTime>,
        path: &Path,
    ) -> Result<()> {
        let log_path = self.path_for(now);
        // Only the worker whose open creates the file writes the header.
        let (mut file, created) = match OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&log_path)
        {
            Ok(file) => (file, true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                (OpenOptions::new().append(true).open(&log_path)?, false)
            }
            Err(err) => return Err(err.into()),
        };

        let mut text = String::new();
        if created {
            text.push_str(PURGE_LOG_HEADER);
            text.push('\n');
        }
        let size_mb = size_bytes as f64 / BYTES_PER_MB as f64;
        let modified = modified
            .map(util::format_log_timestamp)
            .unwrap_or_default();
        text.push_str(&format!(
            "{}\t{}\t{size_mb:.2}\t{modified}\t{}\n",
            util::format_log_timestamp(now),
            self.worker,
            path.display()
        ));
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}
