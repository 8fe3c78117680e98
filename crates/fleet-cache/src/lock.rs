//! Advisory, file-based mutual exclusion for expensive generation.
//!
//! A lock is the file `<resource>.lock`, created exclusively and holding a
//! `"<description> at <timestamp>"` line. There is no heartbeat: the lock's age is the only
//! liveness signal, and a lock older than the maximum wait is treated as abandoned.
//!
//! `wait_for_clear` followed by `acquire` is not atomic. Two workers can both observe "no
//! lock" and then race to create one; the loser gets [`CacheError::LockHeld`] and should treat
//! it as "someone else is generating this, try later".

use crate::artifact;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::throttle::LogThrottle;
use crate::util;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// How `wait_for_clear` ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// There was no lock file.
    Clear,
    /// The lock disappeared while we were polling.
    Released { waited: Duration },
    /// The lock outlived the maximum wait and was deleted.
    StaleRemoved { age: Duration },
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    max_wait: Duration,
    log_interval: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(120 * 60),
            log_interval: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
        }
    }
}

impl LockCoordinator {
    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_wait: config.lock_max_wait,
            log_interval: config.lock_log_interval,
            poll_interval: config.lock_poll_interval,
            clock,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_log_interval(mut self, log_interval: Duration) -> Self {
        self.log_interval = log_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Block until no generation of `resource` is believed to be in progress.
    ///
    /// Staleness is judged from the lock's creation time as seen on entry; the file is not
    /// re-examined for a newer timestamp while polling.
    pub fn wait_for_clear(&self, resource: &Path, description: &str) -> Result<WaitOutcome> {
        let lock = artifact::lock_path(resource);
        let Some(created) = lock_created(&lock)? else {
            return Ok(WaitOutcome::Clear);
        };

        let age = util::age_of(created, self.clock.now());
        if age >= self.max_wait {
            tracing::warn!(
                target: "fleet.cache",
                lock = %lock.display(),
                age_minutes = age.as_secs() / 60,
                "deleting abandoned lock file"
            );
            util::remove_file_idempotent(&lock)?;
            return Ok(WaitOutcome::StaleRemoved { age });
        }

        tracing::info!(
            target: "fleet.cache",
            lock = %lock.display(),
            holder = %read_description(&lock),
            waiter = description,
            "waiting for lock to clear"
        );

        let started = Instant::now();
        // `None` when the configured wait runs past what `Instant` can represent.
        let deadline = started.checked_add(self.max_wait - age);
        let mut throttle = LogThrottle::started_at(self.log_interval, started);
        loop {
            let now = Instant::now();
            let nap = deadline.map_or(self.poll_interval, |deadline| {
                self.poll_interval.min(deadline.saturating_duration_since(now))
            });
            std::thread::sleep(nap);

            if !lock_exists(&lock)? {
                let waited = started.elapsed();
                tracing::info!(
                    target: "fleet.cache",
                    lock = %lock.display(),
                    waited_secs = waited.as_secs(),
                    "lock cleared"
                );
                return Ok(WaitOutcome::Released { waited });
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                let age = age + now.saturating_duration_since(started);
                tracing::warn!(
                    target: "fleet.cache",
                    lock = %lock.display(),
                    age_minutes = age.as_secs() / 60,
                    "lock exceeded maximum wait; deleting it"
                );
                util::remove_file_idempotent(&lock)?;
                return Ok(WaitOutcome::StaleRemoved { age });
            }

            if throttle.ready(now) {
                tracing::info!(
                    target: "fleet.cache",
                    lock = %lock.display(),
                    waiter = description,
                    waited_minutes = now.saturating_duration_since(started).as_secs() / 60,
                    "still waiting for lock"
                );
            }
        }
    }

    /// Exclusively create `<resource>.lock`. Fails with [`CacheError::LockHeld`] if it exists.
    pub fn acquire(&self, resource: &Path, description: &str) -> Result<LockFile> {
        let path = artifact::lock_path(resource);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CacheError::LockHeld { path });
            }
            Err(err) => return Err(err.into()),
        };

        let line = format!(
            "{description} at {}\n",
            util::format_log_timestamp(self.clock.now())
        );
        if let Err(err) = file.write_all(line.as_bytes()) {
            drop(file);
            util::remove_file_best_effort(&path, "lock.acquire.write_failed");
            return Err(err.into());
        }

        tracing::debug!(target: "fleet.cache", lock = %path.display(), "acquired lock");
        Ok(LockFile {
            path,
            released: false,
        })
    }
}

/// A held lock file. Dropping it deletes the file.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file; deleting an already-missing lock succeeds.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        util::remove_file_idempotent(&self.path)?;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.released {
            util::remove_file_best_effort(&self.path, "lock.drop");
        }
    }
}

fn lock_created(lock: &Path) -> Result<Option<SystemTime>> {
    match std::fs::symlink_metadata(lock) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn lock_exists(lock: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(lock) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn read_description(lock: &Path) -> String {
    std::fs::read_to_string(lock)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    fn fast() -> LockCoordinator {
        LockCoordinator::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_log_interval(Duration::from_millis(50))
    }

    fn age_lock(lock: &Path, age: Duration) {
        let when = SystemTime::now() - age;
        set_file_mtime(lock, FileTime::from_system_time(when)).unwrap();
    }

    #[test]
    fn no_lock_means_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = fast()
            .wait_for_clear(&tmp.path().join("Human.fasta"), "test")
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Clear);
    }

    #[test]
    fn acquire_writes_description_and_collides() {
        let tmp = tempfile::tempdir().unwrap();
        let resource = tmp.path().join("Human.fasta");
        let coordinator = fast();

        let held = coordinator.acquire(&resource, "export job 42").unwrap();
        let text = std::fs::read_to_string(held.path()).unwrap();
        assert!(text.starts_with("export job 42 at "), "{text}");

        let err = coordinator.acquire(&resource, "second").unwrap_err();
        assert!(err.is_lock_collision());

        held.release().unwrap();
        assert!(!artifact::lock_path(&resource).exists());
        coordinator.acquire(&resource, "third").unwrap();
    }

    #[test]
    fn dropping_the_guard_releases_the_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let resource = tmp.path().join("Human.fasta");
        {
            let _held = fast().acquire(&resource, "scoped").unwrap();
            assert!(artifact::lock_path(&resource).exists());
        }
        assert!(!artifact::lock_path(&resource).exists());
    }

    #[test]
    fn release_after_external_delete_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let resource = tmp.path().join("Human.fasta");
        let held = fast().acquire(&resource, "x").unwrap();
        std::fs::remove_file(held.path()).unwrap();
        held.release().unwrap();
    }

    #[test]
    fn abandoned_lock_is_deleted_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let resource = tmp.path().join("Human.fasta");
        let lock = artifact::lock_path(&resource);
        std::fs::write(&lock, "old job at 2020-01-01 00:00:00\n").unwrap();
        age_lock(&lock, Duration::from_secs(3 * 60 * 60));

        let started = Instant::now();
        let outcome = fast()
            .with_max_wait(Duration::from_secs(120 * 60))
            .wait_for_clear(&resource, "test")
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::StaleRemoved { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!lock.exists());
    }

    #[test]
    fn unbounded_wait_still_sees_the_release() {
        let tmp = tempfile::tempdir().unwrap();
        let resource = tmp.path().join("Human.fasta");
        let lock = artifact::lock_path(&resource);
        std::fs::write(&lock, "long job\n").unwrap();

        let outcome = std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(100));
                std::fs::remove_file(&lock).unwrap();
            });
            fast()
                .with_max_wait(Duration::MAX)
                .wait_for_clear(&resource, "test")
                .unwrap()
        });
        assert!(matches!(outcome, WaitOutcome::Released { .. }), "{outcome:?}");
    }

    #[test]
    fn lock_that_goes_stale_while_waiting_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let resource = tmp.path().join("Human.fasta");
        let lock = artifact::lock_path(&resource);
        std::fs::write(&lock, "slow job\n").unwrap();
        age_lock(&lock, Duration::from_millis(100));

        let outcome = fast()
            .with_max_wait(Duration::from_millis(400))
            .wait_for_clear(&resource, "test")
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::StaleRemoved { .. }));
        assert!(!lock.exists());
    }
}
