use std::path::PathBuf;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MINUTE: Duration = Duration::from_secs(60);

pub const CACHE_DIR_ENV: &str = "FLEET_CACHE_DIR";
pub const WORKER_ENV: &str = "FLEET_WORKER";

/// Runtime settings for one worker's view of a shared cache root.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Directory holding the cached artifacts (typically a network share).
    pub root: PathBuf,
    /// Identity written to the purge log for every deletion.
    pub worker: String,
    /// Minimum percentage of the volume that should be free (clamped to 1-50 at use).
    pub free_space_threshold_percent: u8,
    /// Artifacts used more recently than this are never evicted.
    pub min_eviction_age: Duration,
    pub lock_max_wait: Duration,
    pub lock_log_interval: Duration,
    pub lock_poll_interval: Duration,
    /// A hash mismatch on an artifact validated more recently than this is "not yet re-verified".
    pub validation_holdoff: Duration,
    /// Name suffixes of derived artifacts whose base artifact also counts as usage.
    pub alias_suffixes: Vec<String>,
    /// Extensions (case-insensitive, without the dot) that identify a primary artifact file.
    pub artifact_extensions: Vec<String>,
    /// Report what eviction would delete without deleting anything.
    pub preview: bool,
    /// The quota policy re-scans the directory after freeing this many bytes in one pass.
    pub quota_rescan_bytes: u64,
    pub quota_max_iterations: usize,
    /// Sleep before each retry of a connection-pool-exhaustion failure.
    pub generator_retry_backoff: Vec<Duration>,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            worker: default_worker_name(),
            free_space_threshold_percent: 10,
            min_eviction_age: 5 * DAY,
            lock_max_wait: 120 * MINUTE,
            lock_log_interval: 5 * MINUTE,
            lock_poll_interval: Duration::from_secs(5),
            validation_holdoff: Duration::from_secs(48 * 60 * 60),
            alias_suffixes: vec![".revCat".to_string()],
            artifact_extensions: ["fasta", "mzML", "mzXML", "mgf", "raw"]
                .into_iter()
                .map(String::from)
                .collect(),
            preview: false,
            quota_rescan_bytes: 10 * crate::util::BYTES_PER_GB,
            quota_max_iterations: 100,
            generator_retry_backoff: vec![Duration::from_secs(20), Duration::from_secs(30)],
        }
    }

    /// Build a config from `FLEET_CACHE_DIR` / `FLEET_WORKER`, defaulting the root to the
    /// current directory.
    pub fn from_env() -> Self {
        let mut config = Self::new(".");
        config.apply_env();
        config
    }

    /// Let `FLEET_CACHE_DIR` and `FLEET_WORKER` override whatever is set.
    pub fn apply_env(&mut self) {
        if let Some(root) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.root = PathBuf::from(root);
        }
        if let Some(worker) = std::env::var(WORKER_ENV)
            .ok()
            .filter(|w| !w.trim().is_empty())
        {
            self.worker = worker;
        }
    }

    pub fn clamped_threshold_percent(&self) -> u8 {
        clamp_threshold_percent(self.free_space_threshold_percent)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

pub fn clamp_threshold_percent(percent: u8) -> u8 {
    percent.clamp(1, 50)
}

fn default_worker_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_clamped_into_one_to_fifty() {
        assert_eq!(clamp_threshold_percent(0), 1);
        assert_eq!(clamp_threshold_percent(12), 12);
        assert_eq!(clamp_threshold_percent(90), 50);
    }

    #[test]
    fn defaults_match_fleet_conventions() {
        let config = CacheConfig::new("/share/fasta");
        assert_eq!(config.min_eviction_age, Duration::from_secs(5 * 24 * 3600));
        assert_eq!(config.lock_max_wait, Duration::from_secs(120 * 60));
        assert_eq!(config.quota_max_iterations, 100);
        assert_eq!(
            config.generator_retry_backoff,
            vec![Duration::from_secs(20), Duration::from_secs(30)]
        );
    }
}
