//! Content fingerprints and the `<artifact>.<hash>.hashcheck` sidecar.
//!
//! The hash lives in the sidecar's *file name* so that a remote directory listing is enough
//! to compare two copies. The sidecar body is informational and may be rewritten (which
//! refreshes its mtime) without the artifact changing.

use crate::artifact::{self, DirListing};
use crate::error::{CacheError, Result};
use crate::util;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A SHA-256 fingerprint stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Streaming hash of a file's contents; artifacts are often several GB.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, hash: &str) -> bool {
        self.0.eq_ignore_ascii_case(hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A hashcheck sidecar found next to an artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hashcheck {
    pub path: PathBuf,
    pub hash: String,
    pub modified: Option<SystemTime>,
}

/// Every hashcheck sidecar of `artifact`, newest first.
pub fn find_hashchecks(artifact: &Path) -> Result<Vec<Hashcheck>> {
    let name = artifact::file_name(artifact)?;
    let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
    let listing = DirListing::read(dir)?;
    Ok(hashchecks_in(&listing, name))
}

pub fn hashchecks_in(listing: &DirListing, artifact_name: &str) -> Vec<Hashcheck> {
    let mut found: Vec<Hashcheck> = listing
        .hashchecks_for(artifact_name)
        .filter_map(|file| {
            let hash = artifact::hashcheck_hash(artifact_name, &file.name)?;
            Some(Hashcheck {
                path: file.path.clone(),
                hash: hash.to_string(),
                modified: file.modified,
            })
        })
        .collect();
    found.sort_by(|a, b| b.modified.cmp(&a.modified));
    found
}

/// Hash `artifact` and write `<artifact>.<sha256>.hashcheck`, replacing any older sidecars.
pub fn write_hashcheck(artifact: &Path, now: SystemTime) -> Result<PathBuf> {
    let fingerprint = Fingerprint::from_file(artifact)?;
    let size = std::fs::metadata(artifact)?.len();
    let sidecar = artifact::hashcheck_path(artifact, fingerprint.as_str());

    let body = format!(
        "hash={fingerprint}\nsize={size}\nfingerprinted_at={}\n",
        util::format_rfc3339(now)
    );
    util::atomic_write(&sidecar, body.as_bytes())?;

    for old in find_hashchecks(artifact)? {
        if old.path != sidecar {
            util::remove_file_best_effort(&old.path, "hashcheck.superseded");
        }
    }

    tracing::debug!(
        target: "fleet.cache",
        path = %sidecar.display(),
        "wrote hashcheck sidecar"
    );
    Ok(sidecar)
}

/// Result of a validation that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    /// The hash does not match, but the sidecar was refreshed within the holdoff window.
    NotYetReverified { expected: String, found: String },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Recompute `artifact`'s hash and compare it with its hashcheck sidecar name.
///
/// Errors with [`CacheError::MissingHashcheck`] when there is no sidecar and with
/// [`CacheError::HashMismatch`] when the hash differs and the newest sidecar is older than
/// `holdoff`.
pub fn validate(artifact: &Path, holdoff: Duration, now: SystemTime) -> Result<ValidationOutcome> {
    let sidecars = find_hashchecks(artifact)?;
    let Some(newest) = sidecars.first() else {
        return Err(CacheError::MissingHashcheck {
            path: artifact.to_path_buf(),
        });
    };

    let fingerprint = Fingerprint::from_file(artifact)?;
    if sidecars.iter().any(|sidecar| fingerprint.matches(&sidecar.hash)) {
        return Ok(ValidationOutcome::Valid);
    }

    let marker_age = newest
        .modified
        .map(|modified| util::age_of(modified, now))
        .unwrap_or(Duration::MAX);
    if marker_age < holdoff {
        tracing::info!(
            target: "fleet.cache",
            path = %artifact.display(),
            expected = %newest.hash,
            found = %fingerprint,
            "hash mismatch within re-verification holdoff; not treating as failure"
        );
        return Ok(ValidationOutcome::NotYetReverified {
            expected: newest.hash.clone(),
            found: fingerprint.to_string(),
        });
    }

    Err(CacheError::HashMismatch {
        path: artifact.to_path_buf(),
        expected: newest.hash.clone(),
        found: fingerprint.to_string(),
    })
}
