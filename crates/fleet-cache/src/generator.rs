//! The seam to the external tool that produces an artifact's bytes.

use crate::throttle::LogThrottle;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    /// The generator's database connection pool was exhausted. Retried with backoff.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("{0}")]
    Failed(String),
}

/// An external producer of artifacts (database export, format conversion, ...).
pub trait Generator {
    /// The file name `generate` would produce for `name`, without producing it.
    fn expected_artifact_name(&self, name: &str) -> String;

    /// Rough size of the produced artifact, used to make room before generating.
    fn estimated_size_bytes(&self, _name: &str) -> Option<u64> {
        None
    }

    /// Write the artifact for `name` into `dir`.
    ///
    /// On success the generator must call [`GenerationProgress::complete`] exactly once with
    /// the produced file name.
    fn generate(
        &self,
        name: &str,
        dir: &Path,
        progress: &GenerationProgress,
    ) -> Result<(), GenerateError>;
}

/// Point-in-time view of a [`GenerationProgress`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub percent_complete: f32,
    pub message: String,
    pub produced: Option<String>,
}

#[derive(Debug)]
struct ProgressState {
    snapshot: ProgressSnapshot,
    throttle: LogThrottle,
}

/// Shared progress of one generation, polled by the caller and updated by the generator.
#[derive(Clone, Debug)]
pub struct GenerationProgress {
    name: Arc<str>,
    state: Arc<Mutex<ProgressState>>,
}

impl GenerationProgress {
    pub fn new(name: &str, log_interval: Duration) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(ProgressState {
                snapshot: ProgressSnapshot::default(),
                throttle: LogThrottle::new(log_interval),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update(&self, percent_complete: f32, message: impl Into<String>) {
        let mut state = self.lock();
        state.snapshot.percent_complete = percent_complete.clamp(0.0, 100.0);
        state.snapshot.message = message.into();
        if state.throttle.ready(Instant::now()) {
            tracing::info!(
                target: "fleet.cache",
                name = %self.name,
                percent = format!("{:.0}", state.snapshot.percent_complete),
                message = %state.snapshot.message,
                "generation progress"
            );
        }
    }

    /// Record the produced file name. Returns `false` if completion was already signalled.
    pub fn complete(&self, produced: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.snapshot.produced.is_some() {
            return false;
        }
        state.snapshot.produced = Some(produced.into());
        state.snapshot.percent_complete = 100.0;
        true
    }

    pub fn produced(&self) -> Option<String> {
        self.lock().snapshot.produced.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot.clone()
    }
}

/// Sticky, shareable "stop accepting new work" flag.
#[derive(Clone, Debug, Default)]
pub struct Backpressure(Arc<AtomicBool>);

impl Backpressure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_signalled_once() {
        let progress = GenerationProgress::new("Human", Duration::from_secs(60));
        let observer = progress.clone();
        progress.update(40.0, "exporting proteins");
        assert_eq!(observer.snapshot().percent_complete, 40.0);

        assert!(progress.complete("Human.fasta"));
        assert!(!progress.complete("Other.fasta"));
        assert_eq!(observer.produced().as_deref(), Some("Human.fasta"));
        assert_eq!(observer.snapshot().percent_complete, 100.0);
    }

    #[test]
    fn backpressure_is_shared_and_sticky() {
        let flag = Backpressure::new();
        let seen_by_caller = flag.clone();
        assert!(!seen_by_caller.is_raised());
        flag.raise();
        assert!(seen_by_caller.is_raised());
    }
}
