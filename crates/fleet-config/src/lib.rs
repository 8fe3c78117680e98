//! `fleet.toml` configuration and `tracing` initialisation for fleet workers.
//!
//! ```toml
//! [cache]
//! root = "/mnt/share/fasta"
//! free_space_threshold_percent = 15
//! min_eviction_age_days = 5
//!
//! [logging]
//! level = "info,fleet.cache=debug"
//! json = true
//! ```
//!
//! Every field is optional. `FLEET_CACHE_DIR`, `FLEET_WORKER` and `RUST_LOG` win over the
//! file.

use fleet_cache::{CacheConfig, BYTES_PER_GB};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(err.message().to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FleetConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// The effective cache settings: defaults, then this file, then the environment.
    pub fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::default();
        self.cache.apply_to(&mut config);
        config.apply_env();
        config
    }
}

/// The `[cache]` table. Unset fields keep the [`CacheConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    pub root: Option<PathBuf>,
    pub worker: Option<String>,
    /// Clamped to 1-50 when used.
    pub free_space_threshold_percent: Option<u8>,
    pub min_eviction_age_days: Option<u64>,
    pub lock_max_wait_minutes: Option<u64>,
    pub lock_log_interval_minutes: Option<u64>,
    pub lock_poll_interval_secs: Option<u64>,
    pub validation_holdoff_hours: Option<u64>,
    pub alias_suffixes: Option<Vec<String>>,
    pub artifact_extensions: Option<Vec<String>>,
    pub preview: Option<bool>,
    pub quota_rescan_gb: Option<u64>,
    pub quota_max_iterations: Option<usize>,
    pub generator_retry_backoff_secs: Option<Vec<u64>>,
}

impl CacheSection {
    pub fn apply_to(&self, config: &mut CacheConfig) {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;

        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(worker) = self.worker.as_ref().filter(|w| !w.trim().is_empty()) {
            config.worker = worker.clone();
        }
        if let Some(percent) = self.free_space_threshold_percent {
            config.free_space_threshold_percent = percent;
        }
        if let Some(days) = self.min_eviction_age_days {
            config.min_eviction_age = Duration::from_secs(days.saturating_mul(24 * HOUR));
        }
        if let Some(minutes) = self.lock_max_wait_minutes {
            config.lock_max_wait = Duration::from_secs(minutes.saturating_mul(MINUTE));
        }
        if let Some(minutes) = self.lock_log_interval_minutes {
            config.lock_log_interval = Duration::from_secs(minutes.saturating_mul(MINUTE));
        }
        if let Some(secs) = self.lock_poll_interval_secs {
            config.lock_poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(hours) = self.validation_holdoff_hours {
            config.validation_holdoff = Duration::from_secs(hours.saturating_mul(HOUR));
        }
        if let Some(suffixes) = &self.alias_suffixes {
            config.alias_suffixes = suffixes.clone();
        }
        if let Some(extensions) = &self.artifact_extensions {
            config.artifact_extensions = extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_string())
                .collect();
        }
        if let Some(preview) = self.preview {
            config.preview = preview;
        }
        if let Some(gb) = self.quota_rescan_gb {
            config.quota_rescan_bytes = gb.saturating_mul(BYTES_PER_GB);
        }
        if let Some(iterations) = self.quota_max_iterations {
            config.quota_max_iterations = iterations.max(1);
        }
        if let Some(backoff) = &self.generator_retry_backoff_secs {
            config.generator_retry_backoff =
                backoff.iter().copied().map(Duration::from_secs).collect();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Also append logs to this file. If it cannot be opened, the other sinks stay active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: `level`, with `RUST_LOG` merged on top when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self
                .file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: std::sync::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = if logging.stderr {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::sink)
        };
        if let Some(file) = file {
            let file = Arc::new(Mutex::new(file));
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter { file }));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "fleet.config",
                    path = %path.display(),
                    "failed to open log file; logging to the remaining sinks only"
                );
            }
        }
    });
}
