//! A shared artifact cache for a fleet of independent workers on a network filesystem.
//!
//! Workers cannot see each other except through the cache directory, so every piece of
//! coordination is a file:
//! - usage is derived from file times, hashcheck sidecars and `.LastUsed` markers
//!   ([`UsageTracker`])
//! - at most one generation per artifact is coordinated with advisory `.lock` files
//!   ([`LockCoordinator`])
//! - space is reclaimed oldest-usage-first under a free-space or a total-size policy
//!   ([`EvictionPlanner`], selected by `MaxDirSize.txt`)
//! - copies on other hosts are compared by size and hashcheck sidecar name
//!   ([`ReplicaSynchronizer`])
//!
//! [`ArtifactCache`] ties these together into acquire-or-generate.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/<Artifact>.<ext>
//! <root>/<Artifact>.<ext>.<hash>.hashcheck
//! <root>/<Artifact>.<ext>.LastUsed          # RFC 3339 timestamp
//! <root>/<ResourceKey>.lock                 # "<description> at <timestamp>"
//! <root>/MaxDirSize.txt                     # "MaxSizeGB=<int>"
//! <root>/PurgeLog_<year>.txt                # Date, Worker, Size_MB, Modify_Date, Path
//! ```
//!
//! None of this is transactional. Deletes treat "already gone" as success because other
//! workers routinely race on the same files.

pub mod artifact;
mod cache;
mod clock;
mod config;
mod error;
mod eviction;
mod generator;
mod hashcheck;
mod lock;
mod purge_log;
mod quota;
mod replica;
mod stash;
mod throttle;
mod transport;
mod usage;
mod util;
mod volume;

pub use artifact::{ArtifactGroup, ArtifactLayout, DirListing};
pub use cache::{AcquireKind, AcquireOptions, AcquireOutcome, ArtifactCache, ReplicaStatus};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{clamp_threshold_percent, CacheConfig, CACHE_DIR_ENV, WORKER_ENV};
pub use error::{CacheError, Result};
pub use eviction::{disk_space, EvictedArtifact, EvictionCandidate, EvictionPlanner, EvictionReport};
pub use generator::{Backpressure, GenerateError, GenerationProgress, Generator, ProgressSnapshot};
pub use hashcheck::{
    find_hashchecks, validate, write_hashcheck, Fingerprint, Hashcheck, ValidationOutcome,
};
pub use lock::{LockCoordinator, LockFile, WaitOutcome};
pub use purge_log::{PurgeLog, PURGE_LOG_HEADER};
pub use quota::{
    parse_quota_marker, quota_bytes, read_quota_marker, QuotaMarkerError, QuotaPolicy,
    MIN_QUOTA_GB,
};
pub use replica::{
    is_up_to_date, replica_matches, LocalReplica, ReconcileOutcome, ReplicaSynchronizer,
};
pub use stash::ArtifactStash;
pub use throttle::LogThrottle;
pub use transport::{Convergence, LocalTransport, RemoteFileInfo, RemoteTarget, Transport};
pub use usage::{UsageSignals, UsageTracker};
pub use util::{
    age_of, atomic_write, dir_size_bytes_nofollow, format_log_timestamp, format_rfc3339,
    parse_timestamp, remove_file_idempotent, BYTES_PER_GB, BYTES_PER_MB,
};
pub use volume::{DiskSpace, Fs2Volume, VolumeStats};
