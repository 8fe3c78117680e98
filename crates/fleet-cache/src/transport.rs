//! Copying artifacts to another host.
//!
//! [`Transport`] is the seam to whatever actually moves bytes (an SFTP or SMB client with its
//! own retry logic). [`LocalTransport`] implements it for a remote share that is mounted
//! into the local filesystem.

use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::util;
use globset::GlobBuilder;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One entry of a remote directory listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: u64,
}

impl RemoteFileInfo {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// A directory on another host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub dir: PathBuf,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            dir: dir.into(),
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.dir.display())
    }
}

/// Result of waiting for an in-flight remote copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Convergence {
    /// The remote size reached the local size.
    pub converged: bool,
    /// The remote file cannot become a good copy (stalled, or larger than the source).
    pub abort: bool,
}

pub trait Transport: Send + Sync + fmt::Debug {
    /// Regular files in `dir` whose names match `pattern` (a case-insensitive glob).
    fn list_remote(&self, dir: &Path, pattern: &str) -> Result<Vec<RemoteFileInfo>>;

    /// Copy `src` over `dst`, holding `<dst>.lock` on the remote side while copying.
    fn copy_file_with_lock(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Block (at most `timeout`) while another writer's copy into `dir/remote.name` grows.
    fn wait_for_convergence(
        &self,
        local_size: u64,
        dir: &Path,
        remote: &RemoteFileInfo,
        timeout: Duration,
    ) -> Result<Convergence>;

    /// Delete a remote file; a missing file is not an error.
    fn remove_remote(&self, path: &Path) -> Result<()>;
}

/// [`Transport`] for a remote share mounted at a local path.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    locks: LockCoordinator,
    poll_interval: Duration,
    stall_timeout: Duration,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self {
            locks: LockCoordinator::default(),
            poll_interval: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl LocalTransport {
    pub fn new(locks: LockCoordinator) -> Self {
        Self {
            locks,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// A remote file whose size does not change for this long is treated as an abandoned copy.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }
}

impl Transport for LocalTransport {
    fn list_remote(&self, dir: &Path, pattern: &str) -> Result<Vec<RemoteFileInfo>> {
        let matcher = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()?
            .compile_matcher();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !matcher.is_match(&name) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.is_file() => out.push(RemoteFileInfo::new(name, meta.len())),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn copy_file_with_lock(&self, src: &Path, dst: &Path) -> Result<()> {
        let description = format!("copy from {}", src.display());
        self.locks.wait_for_clear(dst, &description)?;
        let lock = self.locks.acquire(dst, &description)?;

        util::atomic_write_with(dst, |out| {
            let mut reader = File::open(src)?;
            io::copy(&mut reader, out)?;
            Ok(())
        })?;

        lock.release()?;
        tracing::debug!(
            target: "fleet.cache",
            src = %src.display(),
            dst = %dst.display(),
            "copied file to remote"
        );
        Ok(())
    }

    fn wait_for_convergence(
        &self,
        local_size: u64,
        dir: &Path,
        remote: &RemoteFileInfo,
        timeout: Duration,
    ) -> Result<Convergence> {
        let path = dir.join(&remote.name);
        let started = Instant::now();
        let mut last_size = remote.size;
        let mut last_growth = started;

        loop {
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                // The other writer gave up and cleaned up after itself.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Ok(Convergence::default())
                }
                Err(err) => return Err(err.into()),
            };
            let now = Instant::now();

            if size == local_size {
                return Ok(Convergence {
                    converged: true,
                    abort: false,
                });
            }
            if size > local_size {
                tracing::warn!(
                    target: "fleet.cache",
                    path = %path.display(),
                    remote_size = size,
                    local_size,
                    "remote copy is larger than the source"
                );
                return Ok(Convergence {
                    converged: false,
                    abort: true,
                });
            }
            if size != last_size {
                last_size = size;
                last_growth = now;
            } else if now.saturating_duration_since(last_growth) >= self.stall_timeout {
                tracing::warn!(
                    target: "fleet.cache",
                    path = %path.display(),
                    remote_size = size,
                    local_size,
                    "remote copy stopped growing"
                );
                return Ok(Convergence {
                    converged: false,
                    abort: true,
                });
            }

            let elapsed = now.saturating_duration_since(started);
            if elapsed >= timeout {
                return Ok(Convergence::default());
            }
            std::thread::sleep(self.poll_interval.min(timeout - elapsed));
        }
    }

    fn remove_remote(&self, path: &Path) -> Result<()> {
        util::remove_file_idempotent(path)?;
        Ok(())
    }
}
