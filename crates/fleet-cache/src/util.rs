use crate::error::{CacheError, Result};
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

pub const BYTES_PER_MB: u64 = 1024 * 1024;
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Remove a single file, treating "already gone" as success.
///
/// Returns `Ok(true)` if this call removed the file and `Ok(false)` if it was missing.
pub fn remove_file_idempotent(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match remove_file_idempotent(path) {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(
                target: "fleet.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove file"
            );
            false
        }
    }
}

/// Age of `then` relative to `now`; timestamps in the future have age zero.
pub fn age_of(then: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or(Duration::ZERO)
}

/// Best-effort recursive size of every regular file (and symlink) under `root`.
pub fn dir_size_bytes_nofollow(root: &Path) -> u64 {
    let mut total = 0_u64;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let should_log = match err.io_error() {
                    Some(io_err) => io_err.kind() != io::ErrorKind::NotFound,
                    None => true,
                };
                if should_log {
                    let path = err.path().map(|p| p.display().to_string());
                    tracing::debug!(
                        target: "fleet.cache",
                        path,
                        error = %err,
                        "failed to walk cache directory while computing size"
                    );
                }
                continue;
            }
        };
        let ty = entry.file_type();
        if !(ty.is_file() || ty.is_symlink()) {
            continue;
        }
        let len = match fs::symlink_metadata(entry.path()) {
            Ok(meta) => meta.len(),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "fleet.cache",
                        path = %entry.path().display(),
                        error = %err,
                        "failed to stat cache entry while computing size"
                    );
                }
                continue;
            }
        };
        total = total.saturating_add(len);
    }
    total
}

pub fn format_rfc3339(when: SystemTime) -> String {
    let when = OffsetDateTime::from(when);
    when.format(&Rfc3339)
        .unwrap_or_else(|_| when.unix_timestamp().to_string())
}

/// `YYYY-MM-DD HH:MM:SS` in UTC, the format used by the purge log.
pub fn format_log_timestamp(when: SystemTime) -> String {
    let when = OffsetDateTime::from(when);
    when.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| when.unix_timestamp().to_string())
}

pub fn utc_year(when: SystemTime) -> i32 {
    OffsetDateTime::from(when).year()
}

/// Parse a timestamp written by [`format_rfc3339`] or [`format_log_timestamp`].
pub fn parse_timestamp(text: &str) -> Result<SystemTime> {
    let text = text.trim();
    if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
        return Ok(parsed.into());
    }
    let naive = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(text, naive) {
        return Ok(parsed.assume_utc().into());
    }
    let iso = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(text, iso) {
        return Ok(parsed.assume_utc().into());
    }
    Err(CacheError::InvalidTimestamp {
        text: text.to_string(),
    })
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a uniquely named sibling temp file and a rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_write_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<()>,
) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<()> {
        write(&mut file)?;
        file.sync_all()?;
        Ok(())
    })();
    drop(file);
    if let Err(err) = write_result {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed");
        return Err(err);
    }

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write.rename_failed");
        return Err(CacheError::from(err));
    }
    Ok(())
}

pub(crate) fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 64;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err)
                if cfg!(windows) && (err.kind() == io::ErrorKind::AlreadyExists || to.exists()) =>
            {
                // On Windows `rename` doesn't overwrite; concurrent writers can race here.
                remove_file_idempotent(to)?;
                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Temp files created by [`atomic_write`] carry this marker in their name.
pub(crate) const TMP_MARKER: &str = ".tmp.";

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!("{TMP_MARKER}{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_through_both_formats() {
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(parse_timestamp(&format_rfc3339(when)).unwrap(), when);
        assert_eq!(parse_timestamp(&format_log_timestamp(when)).unwrap(), when);
        assert_eq!(format_log_timestamp(when), "2023-11-14 22:13:20");
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday-ish").unwrap_err();
        assert!(matches!(err, CacheError::InvalidTimestamp { .. }));
    }

    #[test]
    fn remove_missing_file_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gone.fasta");
        std::fs::write(&path, b"x").unwrap();
        assert!(remove_file_idempotent(&path).unwrap());
        assert!(!remove_file_idempotent(&path).unwrap());
    }

    #[test]
    fn atomic_write_replaces_existing_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.LastUsed");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(TMP_MARKER))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn future_timestamps_have_zero_age() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(age_of(now + Duration::from_secs(5), now), Duration::ZERO);
        assert_eq!(age_of(now - Duration::from_secs(5), now), Duration::from_secs(5));
    }
}
