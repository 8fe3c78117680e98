use crate::artifact;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionPlanner, EvictionReport};
use crate::generator::{Backpressure, GenerateError, GenerationProgress, Generator};
use crate::hashcheck::{self, ValidationOutcome};
use crate::lock::LockCoordinator;
use crate::replica::{ReconcileOutcome, ReplicaSynchronizer};
use crate::stash::ArtifactStash;
use crate::transport::RemoteTarget;
use crate::usage::UsageTracker;
use crate::util::BYTES_PER_MB;
use crate::volume::{Fs2Volume, VolumeStats};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Never let eviction delete the artifact being acquired.
    pub protect_for_purge: bool,
    /// Report the artifact name without generating anything or deleting anything.
    pub preview: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            protect_for_purge: true,
            preview: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireKind {
    /// A valid copy was already present.
    Hit,
    Generated,
    Preview,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplicaStatus {
    Synced { outcome: ReconcileOutcome },
    /// Replication failed; the local artifact is still good.
    Failed { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AcquireOutcome {
    pub path: PathBuf,
    pub kind: AcquireKind,
    pub replica: Option<ReplicaStatus>,
}

/// Acquire-or-generate over one shared cache root.
#[derive(Debug)]
pub struct ArtifactCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    usage: UsageTracker,
    locks: LockCoordinator,
    planner: EvictionPlanner,
    replica: Option<(ReplicaSynchronizer, RemoteTarget)>,
    backpressure: Backpressure,
}

impl ArtifactCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(Fs2Volume))
    }

    pub fn with_parts(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        volume: Arc<dyn VolumeStats>,
    ) -> Self {
        Self {
            usage: UsageTracker::new(config.alias_suffixes.iter().cloned()),
            locks: LockCoordinator::from_config(&config, clock.clone()),
            planner: EvictionPlanner::from_config(&config, clock.clone(), volume),
            clock,
            config,
            replica: None,
            backpressure: Backpressure::new(),
        }
    }

    /// Push every produced or hit artifact to `target` after acquiring it.
    pub fn with_replica(mut self, sync: ReplicaSynchronizer, target: RemoteTarget) -> Self {
        self.replica = Some((sync, target));
        self
    }

    /// Share a backpressure flag with other caches or with the job scheduler.
    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn planner(&self) -> &EvictionPlanner {
        &self.planner
    }

    pub fn backpressure(&self) -> Backpressure {
        self.backpressure.clone()
    }

    /// `true` once generation has failed persistently on connection-pool exhaustion.
    pub fn should_stop_accepting_work(&self) -> bool {
        self.backpressure.is_raised()
    }

    /// Return a usable copy of `name`, generating it if needed.
    ///
    /// A present copy that fails validation (no hashcheck sidecar, or a mismatch outside the
    /// holdoff) is an error; it is neither regenerated nor touched.
    pub fn acquire(
        &self,
        name: &str,
        generator: &dyn Generator,
        options: AcquireOptions,
    ) -> Result<AcquireOutcome> {
        let root = self.root();
        let expected = generator.expected_artifact_name(name);
        let path = root.join(&expected);
        let protected = options
            .protect_for_purge
            .then(|| artifact::base_name(&expected).to_string());

        let required_free_mb = generator
            .estimated_size_bytes(name)
            .map_or(0, |bytes| bytes.div_ceil(BYTES_PER_MB));
        let planner = self
            .planner
            .clone()
            .with_preview(self.config.preview || options.preview);
        self.evict_best_effort(
            &planner,
            required_free_mb,
            protected.as_deref(),
            "before generation",
        );

        if options.preview {
            return Ok(AcquireOutcome {
                path,
                kind: AcquireKind::Preview,
                replica: None,
            });
        }

        let description = format!("{} generating {expected}", self.config.worker);
        self.locks.wait_for_clear(&path, &description)?;

        if self.is_usable(&path)? {
            tracing::info!(target: "fleet.cache", path = %path.display(), "cache hit");
            return self.finish(path, AcquireKind::Hit, options, &planner);
        }

        let lock = self.locks.acquire(&path, &description)?;
        let mut stash = ArtifactStash::new(&path);
        stash.cache()?;
        let previous_sidecars: Vec<PathBuf> = hashcheck::find_hashchecks(&path)?
            .into_iter()
            .map(|sidecar| sidecar.path)
            .collect();

        let progress = GenerationProgress::new(name, self.config.lock_log_interval);
        let produced = self
            .generate_with_retry(name, generator, &progress)
            .and_then(|()| {
                progress
                    .produced()
                    .ok_or_else(|| CacheError::GeneratorDidNotSignal {
                        name: name.to_string(),
                    })
            });
        let produced = match produced {
            Ok(produced) => root.join(produced),
            Err(err) => {
                if let Err(restore_err) = settle_stash(&mut stash, None) {
                    tracing::warn!(
                        target: "fleet.cache",
                        path = %path.display(),
                        error = %restore_err,
                        "failed to restore previous artifact after generation failure"
                    );
                }
                return Err(err);
            }
        };

        settle_stash(&mut stash, Some(&produced))?;
        let generator_wrote_sidecar = hashcheck::find_hashchecks(&produced)?
            .iter()
            .any(|sidecar| !previous_sidecars.contains(&sidecar.path));
        if !generator_wrote_sidecar {
            hashcheck::write_hashcheck(&produced, self.clock.now())?;
        }
        lock.release()?;

        tracing::info!(
            target: "fleet.cache",
            name,
            path = %produced.display(),
            "generated artifact"
        );
        self.finish(produced, AcquireKind::Generated, options, &planner)
    }

    /// Recompute the artifact's hash and check it against its hashcheck sidecar.
    pub fn validate(&self, artifact: &Path) -> Result<ValidationOutcome> {
        hashcheck::validate(artifact, self.config.validation_holdoff, self.clock.now())
    }

    /// Explicit purge: apply the root's eviction policy with the configured threshold.
    pub fn purge(&self, required_free_mb: u64) -> Result<EvictionReport> {
        self.planner.ensure_space(
            self.root(),
            self.config.clamped_threshold_percent(),
            required_free_mb,
            None,
        )
    }

    fn is_usable(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        // Valid and not-yet-re-verified copies are both used as they are.
        self.validate(path).inspect_err(|err| {
            tracing::warn!(
                target: "fleet.cache",
                path = %path.display(),
                error = %err,
                "cached artifact failed validation"
            );
        })?;
        Ok(true)
    }

    fn generate_with_retry(
        &self,
        name: &str,
        generator: &dyn Generator,
        progress: &GenerationProgress,
    ) -> Result<()> {
        let backoff = &self.config.generator_retry_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match generator.generate(name, self.root(), progress) {
                Ok(()) => return Ok(()),
                Err(GenerateError::PoolExhausted(message)) => {
                    let Some(delay) = backoff.get(attempt - 1) else {
                        tracing::error!(
                            target: "fleet.cache",
                            name,
                            attempts = attempt,
                            error = %message,
                            "connection pool still exhausted; asking the fleet to stop accepting work"
                        );
                        self.backpressure.raise();
                        return Err(CacheError::ConnectionPoolExhausted {
                            attempts: attempt,
                            message,
                        });
                    };
                    tracing::warn!(
                        target: "fleet.cache",
                        name,
                        attempt,
                        retry_in_secs = delay.as_secs(),
                        error = %message,
                        "connection pool exhausted; retrying"
                    );
                    std::thread::sleep(*delay);
                }
                Err(GenerateError::Failed(message)) => {
                    return Err(CacheError::Generator {
                        name: name.to_string(),
                        message,
                    });
                }
            }
        }
    }

    fn finish(
        &self,
        path: PathBuf,
        kind: AcquireKind,
        options: AcquireOptions,
        planner: &EvictionPlanner,
    ) -> Result<AcquireOutcome> {
        self.usage.touch(&path, self.clock.now())?;

        let protected = options
            .protect_for_purge
            .then(|| artifact::file_name(&path).map(|n| artifact::base_name(n).to_string()))
            .transpose()?;
        self.evict_best_effort(planner, 0, protected.as_deref(), "cleanup");

        let replica = self.replicate(&path);
        Ok(AcquireOutcome {
            path,
            kind,
            replica,
        })
    }

    fn replicate(&self, path: &Path) -> Option<ReplicaStatus> {
        let (sync, target) = self.replica.as_ref()?;
        Some(match sync.reconcile(path, target, true) {
            Ok(outcome) => ReplicaStatus::Synced { outcome },
            Err(err) => {
                tracing::warn!(
                    target: "fleet.cache",
                    path = %path.display(),
                    remote = %target,
                    error = %err,
                    "replication failed; local artifact is unaffected"
                );
                ReplicaStatus::Failed {
                    message: err.to_string(),
                }
            }
        })
    }

    fn evict_best_effort(
        &self,
        planner: &EvictionPlanner,
        required_free_mb: u64,
        protected: Option<&str>,
        phase: &'static str,
    ) {
        let result = planner.ensure_space(
            self.root(),
            self.config.clamped_threshold_percent(),
            required_free_mb,
            protected,
        );
        if let Err(err) = result {
            tracing::warn!(
                target: "fleet.cache",
                root = %self.root().display(),
                phase,
                error = %err,
                "eviction failed; continuing"
            );
        }
    }
}

/// Resolve a stashed previous copy once generation has finished.
///
/// The backup is dropped only when the generator produced a new file at the stashed path;
/// on failure, or when it wrote somewhere else, the previous copy is put back.
fn settle_stash(stash: &mut ArtifactStash, produced: Option<&Path>) -> Result<()> {
    if !stash.is_cached() {
        return Ok(());
    }
    match produced {
        Some(produced) if produced == stash.artifact() => stash.discard(),
        Some(produced) => {
            tracing::warn!(
                target: "fleet.cache",
                expected = %stash.artifact().display(),
                produced = %produced.display(),
                "generator produced a different artifact; keeping the previous copy"
            );
            stash.restore()
        }
        None => stash.restore(),
    }
}
