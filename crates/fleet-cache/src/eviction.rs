//! Space-budget eviction for a shared cache root.
//!
//! Two interchangeable policies are selected once per root by the presence of
//! `MaxDirSize.txt` (see [`QuotaPolicy`]):
//! - free space: delete oldest-used artifacts until the volume has `threshold_percent` free
//!   (and, optionally, an absolute number of free megabytes)
//! - total size: delete oldest-used artifacts until the directory tree fits the quota
//!
//! Both policies visit candidates oldest-usage-first, never delete anything used within the
//! minimum age (five days by default; the loop stops the moment it reaches such an artifact),
//! never delete the caller's own protected artifact, and record every deletion in the yearly
//! purge log.
//!
//! Other workers may be purging the same directory at the same time. Every delete treats
//! "already gone" as success, and the total-size policy re-scans after each chunk of deletions
//! instead of trusting a victim list computed up front.

use crate::artifact::{self, ArtifactGroup, ArtifactLayout};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::purge_log::PurgeLog;
use crate::quota::{self, QuotaPolicy};
use crate::usage::UsageTracker;
use crate::util::{self, BYTES_PER_GB, BYTES_PER_MB};
use crate::volume::{DiskSpace, Fs2Volume, VolumeStats};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// An artifact group with its effective usage time.
#[derive(Clone, Debug)]
pub struct EvictionCandidate {
    pub group: ArtifactGroup,
    pub last_used: SystemTime,
    pub age: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvictedArtifact {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Usage age at the time of deletion.
    pub age_secs: u64,
}

/// Result summary from one eviction run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvictionReport {
    pub policy: QuotaPolicy,
    /// Nothing was deleted; sizes after eviction are estimates.
    pub preview: bool,
    /// Free bytes on the volume (free-space policy) or total bytes under the root (quota policy).
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub freed_bytes: u64,
    pub deleted: Vec<EvictedArtifact>,
    /// Number of individual files that could not be deleted.
    pub failed_deletes: usize,
    /// Eviction stopped at an artifact younger than the minimum age.
    pub floor_hit: bool,
    /// Bytes still missing to reach the target; zero when the target was met.
    pub shortfall_bytes: u64,
    pub iterations: usize,
}

impl EvictionReport {
    fn new(policy: QuotaPolicy, preview: bool, before_bytes: u64) -> Self {
        Self {
            policy,
            preview,
            before_bytes,
            after_bytes: before_bytes,
            freed_bytes: 0,
            deleted: Vec::new(),
            failed_deletes: 0,
            floor_hit: false,
            shortfall_bytes: 0,
            iterations: 0,
        }
    }

    pub fn target_met(&self) -> bool {
        self.shortfall_bytes == 0
    }
}

#[derive(Debug, Clone)]
pub struct EvictionPlanner {
    layout: ArtifactLayout,
    usage: UsageTracker,
    volume: Arc<dyn VolumeStats>,
    clock: Arc<dyn Clock>,
    worker: String,
    min_age: Duration,
    rescan_bytes: u64,
    max_iterations: usize,
    preview: bool,
}

impl EvictionPlanner {
    pub fn from_config(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        volume: Arc<dyn VolumeStats>,
    ) -> Self {
        Self {
            layout: ArtifactLayout::new(config.artifact_extensions.iter().cloned()),
            usage: UsageTracker::new(config.alias_suffixes.iter().cloned()),
            volume,
            clock,
            worker: config.worker.clone(),
            min_age: config.min_eviction_age,
            rescan_bytes: config.quota_rescan_bytes,
            max_iterations: config.quota_max_iterations.max(1),
            preview: config.preview,
        }
    }

    /// Planner using the system clock and the real volume.
    pub fn new(config: &CacheConfig) -> Self {
        Self::from_config(config, Arc::new(SystemClock), Arc::new(Fs2Volume))
    }

    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Apply whichever policy governs `root`.
    ///
    /// `threshold_percent` and `required_free_mb` only matter when `root` has no usable
    /// `MaxDirSize.txt`.
    pub fn ensure_space(
        &self,
        root: &Path,
        threshold_percent: u8,
        required_free_mb: u64,
        protected_base_name: Option<&str>,
    ) -> Result<EvictionReport> {
        match self.ensure_under_quota(root, protected_base_name)? {
            Some(report) => Ok(report),
            None => self.ensure_free_space(
                root,
                threshold_percent,
                required_free_mb,
                protected_base_name,
            ),
        }
    }

    /// All artifact groups under `root`, oldest effective usage first.
    ///
    /// Crash leftovers (stash backups, temp files) are included by modification time so
    /// that bytes counted against the quota can always be reclaimed.
    pub fn candidates(&self, root: &Path) -> Result<Vec<EvictionCandidate>> {
        let now = self.clock.now();
        let mut candidates = Vec::new();
        for listing in artifact::listings(root)? {
            for group in self.layout.groups_in(&listing) {
                let last_used = self
                    .usage
                    .effective_last_used_in(&listing, &group.name)
                    .or(group.modified)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push(EvictionCandidate {
                    age: util::age_of(last_used, now),
                    last_used,
                    group,
                });
            }
            for group in self.layout.leftovers_in(&listing) {
                let last_used = group.modified.unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push(EvictionCandidate {
                    age: util::age_of(last_used, now),
                    last_used,
                    group,
                });
            }
        }
        candidates.sort_by(|a, b| {
            a.last_used
                .cmp(&b.last_used)
                .then_with(|| a.group.path.cmp(&b.group.path))
        });
        Ok(candidates)
    }

    /// Percentage-free-space policy.
    pub fn ensure_free_space(
        &self,
        root: &Path,
        threshold_percent: u8,
        required_free_mb: u64,
        protected_base_name: Option<&str>,
    ) -> Result<EvictionReport> {
        let threshold_percent = crate::config::clamp_threshold_percent(threshold_percent);
        let required_free_bytes = required_free_mb.saturating_mul(BYTES_PER_MB);
        let policy = QuotaPolicy::FreeSpace {
            threshold_percent,
            required_free_mb,
        };

        let start = self.volume.disk_space(root)?;
        let mut report = EvictionReport::new(policy, self.preview, start.free_bytes);
        report.iterations = 1;
        if start.meets(threshold_percent, required_free_bytes) {
            return Ok(report);
        }

        tracing::info!(
            target: "fleet.cache",
            root = %root.display(),
            free_percent = format!("{:.1}", start.free_percent()),
            threshold_percent,
            required_free_mb,
            "free space below target; evicting least recently used artifacts"
        );

        let purge_log = PurgeLog::new(root, self.worker.clone());
        let mut space = start;
        for candidate in self.candidates(root)? {
            if candidate.age < self.min_age {
                report.floor_hit = true;
                self.log_floor_hit(root, &candidate);
                break;
            }
            if is_protected(&candidate.group, protected_base_name) {
                continue;
            }

            self.evict(&candidate, &purge_log, &mut report);
            space = if self.preview {
                start.after_freeing(report.freed_bytes)
            } else {
                self.volume
                    .disk_space(root)
                    .unwrap_or_else(|_| start.after_freeing(report.freed_bytes))
            };
            if space.meets(threshold_percent, required_free_bytes) {
                break;
            }
        }

        report.after_bytes = space.free_bytes;
        report.shortfall_bytes = space.shortfall(threshold_percent, required_free_bytes);
        self.finish(root, &report);
        Ok(report)
    }

    /// Total-size-quota policy driven by `<root>/MaxDirSize.txt`.
    ///
    /// Returns `Ok(None)` when there is no usable marker, meaning the free-space policy applies.
    pub fn ensure_under_quota(
        &self,
        root: &Path,
        protected_base_name: Option<&str>,
    ) -> Result<Option<EvictionReport>> {
        match QuotaPolicy::for_root(root, 0, 0) {
            QuotaPolicy::TotalSize { max_size_gb } => self
                .enforce_quota(root, max_size_gb, protected_base_name)
                .map(Some),
            QuotaPolicy::FreeSpace { .. } => Ok(None),
        }
    }

    /// Keep the tree under `root` within `max_size_gb` (clamped to at least 10 GB).
    pub fn enforce_quota(
        &self,
        root: &Path,
        max_size_gb: u64,
        protected_base_name: Option<&str>,
    ) -> Result<EvictionReport> {
        let max_size_gb = max_size_gb.max(quota::MIN_QUOTA_GB);
        let quota = quota::quota_bytes(max_size_gb);
        let policy = QuotaPolicy::TotalSize { max_size_gb };
        let purge_log = PurgeLog::new(root, self.worker.clone());

        let mut total = util::dir_size_bytes_nofollow(root);
        let mut report = EvictionReport::new(policy, self.preview, total);

        for iteration in 1..=self.max_iterations {
            report.iterations = iteration;
            if iteration > 1 {
                total = util::dir_size_bytes_nofollow(root);
            }
            if total <= quota {
                break;
            }
            if iteration == 1 {
                tracing::info!(
                    target: "fleet.cache",
                    root = %root.display(),
                    total_gb = format!("{:.2}", total as f64 / BYTES_PER_GB as f64),
                    max_size_gb,
                    "directory over quota; evicting least recently used artifacts"
                );
            }

            let freed_before_pass = report.freed_bytes;
            let deleted_before_pass = report.deleted.len();
            for candidate in self.candidates(root)? {
                if candidate.age < self.min_age {
                    report.floor_hit = true;
                    self.log_floor_hit(root, &candidate);
                    break;
                }
                if is_protected(&candidate.group, protected_base_name) {
                    continue;
                }

                self.evict(&candidate, &purge_log, &mut report);
                let pass_freed = report.freed_bytes - freed_before_pass;
                if total.saturating_sub(pass_freed) <= quota {
                    break;
                }
                if !self.preview && pass_freed > self.rescan_bytes {
                    // Others may be deleting the same candidates; start over from a fresh scan.
                    break;
                }
            }

            let pass_freed = report.freed_bytes - freed_before_pass;
            let progressed = report.deleted.len() > deleted_before_pass;
            if self.preview {
                total = total.saturating_sub(pass_freed);
                break;
            }
            if report.floor_hit || !progressed {
                total = util::dir_size_bytes_nofollow(root);
                break;
            }
            if iteration == self.max_iterations {
                total = util::dir_size_bytes_nofollow(root);
                tracing::warn!(
                    target: "fleet.cache",
                    root = %root.display(),
                    iterations = iteration,
                    "quota eviction stopped at its iteration cap"
                );
            }
        }

        report.after_bytes = total;
        report.shortfall_bytes = total.saturating_sub(quota);
        self.finish(root, &report);
        Ok(report)
    }

    /// Delete (or, in preview, pretend to delete) one candidate and record it.
    fn evict(
        &self,
        candidate: &EvictionCandidate,
        purge_log: &PurgeLog,
        report: &mut EvictionReport,
    ) {
        let group = &candidate.group;
        if self.preview {
            tracing::info!(
                target: "fleet.cache",
                path = %group.path.display(),
                size_mb = group.size_bytes / BYTES_PER_MB,
                age_days = candidate.age.as_secs() / 86_400,
                "preview: would evict artifact"
            );
        } else {
            let failures = delete_group(group);
            report.failed_deletes += failures.files;
            if failures.primary {
                return;
            }
            tracing::info!(
                target: "fleet.cache",
                path = %group.path.display(),
                size_mb = group.size_bytes / BYTES_PER_MB,
                age_days = candidate.age.as_secs() / 86_400,
                "evicted artifact"
            );
            if let Err(err) =
                purge_log.record(self.clock.now(), group.size_bytes, group.modified, &group.path)
            {
                tracing::warn!(
                    target: "fleet.cache",
                    path = %group.path.display(),
                    error = %err,
                    "failed to append to purge log"
                );
            }
        }

        report.freed_bytes = report.freed_bytes.saturating_add(group.size_bytes);
        report.deleted.push(EvictedArtifact {
            name: group.name.clone(),
            path: group.path.clone(),
            size_bytes: group.size_bytes,
            age_secs: candidate.age.as_secs(),
        });
    }

    fn log_floor_hit(&self, root: &Path, candidate: &EvictionCandidate) {
        tracing::info!(
            target: "fleet.cache",
            root = %root.display(),
            next = %candidate.group.name,
            min_age_days = self.min_age.as_secs() / 86_400,
            "no artifacts older than the minimum age remain"
        );
    }

    fn finish(&self, root: &Path, report: &EvictionReport) {
        if report.failed_deletes > 0 {
            tracing::warn!(
                target: "fleet.cache",
                root = %root.display(),
                failed = report.failed_deletes,
                "{} files could not be deleted",
                report.failed_deletes
            );
        }
        if !report.target_met() {
            tracing::warn!(
                target: "fleet.cache",
                root = %root.display(),
                shortfall_mb = report.shortfall_bytes / BYTES_PER_MB,
                floor_hit = report.floor_hit,
                "eviction could not reach its target"
            );
        }
    }
}

fn is_protected(group: &ArtifactGroup, protected_base_name: Option<&str>) -> bool {
    protected_base_name.is_some_and(|protected| {
        group.base_name.eq_ignore_ascii_case(protected)
            || group.name.eq_ignore_ascii_case(protected)
    })
}

#[derive(Debug, Default)]
struct DeleteFailures {
    files: usize,
    primary: bool,
}

/// Remove an artifact and then its companions. Missing files count as removed.
fn delete_group(group: &ArtifactGroup) -> DeleteFailures {
    let mut failures = DeleteFailures::default();
    if let Err(err) = util::remove_file_idempotent(&group.path) {
        tracing::warn!(
            target: "fleet.cache",
            path = %group.path.display(),
            error = %err,
            "failed to delete artifact"
        );
        failures.files += 1;
        failures.primary = true;
        // Keep the companions; they still describe a file that exists.
        return failures;
    }
    for companion in &group.companions {
        if let Err(err) = util::remove_file_idempotent(companion) {
            tracing::warn!(
                target: "fleet.cache",
                path = %companion.display(),
                error = %err,
                "failed to delete artifact companion"
            );
            failures.files += 1;
        }
    }
    failures
}

/// Free space currently available on the volume holding `root`.
pub fn disk_space(root: &Path) -> Result<DiskSpace> {
    Ok(Fs2Volume.disk_space(root)?)
}
