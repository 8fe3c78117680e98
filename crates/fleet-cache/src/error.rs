use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the shared artifact cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("invalid glob pattern {pattern}: {message}")]
    Glob { pattern: String, message: String },

    #[error("lock file {path} already exists; another worker is generating this resource")]
    LockHeld { path: PathBuf },

    #[error("artifact {path} has no file name")]
    InvalidArtifactName { path: PathBuf },

    #[error("artifact {path} has no hashcheck sidecar; cannot validate")]
    MissingHashcheck { path: PathBuf },

    #[error("hash mismatch for {path}: expected {expected}, found {found}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("generator failed for {name}: {message}")]
    Generator { name: String, message: String },

    #[error("generator did not signal completion for {name}")]
    GeneratorDidNotSignal { name: String },

    #[error("connection pool exhausted after {attempts} attempts: {message}")]
    ConnectionPoolExhausted { attempts: usize, message: String },

    #[error("replica {remote} for {path} is corrupt or stale; in-flight copy aborted")]
    ReplicaAborted { path: PathBuf, remote: String },

    #[error("replication of {path} to {remote} failed: {message}")]
    Replica {
        path: PathBuf,
        remote: String,
        message: String,
    },

    #[error("stash for {path} is idle; nothing to restore")]
    StashNotCached { path: PathBuf },

    #[error("unrecognised timestamp {text:?}")]
    InvalidTimestamp { text: String },
}

impl From<globset::Error> for CacheError {
    fn from(err: globset::Error) -> Self {
        Self::Glob {
            pattern: err.glob().unwrap_or_default().to_string(),
            message: err.kind().to_string(),
        }
    }
}

impl CacheError {
    /// `true` when the failure means "someone else holds this resource, retry later".
    pub fn is_lock_collision(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}
