use crate::error::{CacheError, Result};
use crate::util;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Backups made by [`ArtifactStash::cache`] carry this marker in their name.
pub(crate) const STASH_MARKER: &str = ".stash.";

#[derive(Clone, Debug, PartialEq, Eq)]
enum StashState {
    Idle,
    Cached { backup: PathBuf },
}

/// Keeps the previous copy of an artifact aside while it is regenerated.
///
/// `cache` moves the current file to a sibling backup; afterwards exactly one of `restore`
/// (generation failed, put the old copy back) or `discard` (generation succeeded, drop the
/// backup) is expected. Calling either while idle is an error, not a panic.
#[derive(Debug)]
pub struct ArtifactStash {
    artifact: PathBuf,
    state: StashState,
}

impl ArtifactStash {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            state: StashState::Idle,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.state, StashState::Cached { .. })
    }

    /// Move the artifact aside. Returns `false` when there was nothing to move.
    pub fn cache(&mut self) -> Result<bool> {
        if self.is_cached() {
            return Ok(true);
        }
        let backup = self.backup_path();
        match std::fs::rename(&self.artifact, &backup) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(
            target: "fleet.cache",
            path = %self.artifact.display(),
            backup = %backup.display(),
            "stashed existing artifact"
        );
        self.state = StashState::Cached { backup };
        Ok(true)
    }

    /// Put the stashed copy back, replacing whatever is at the artifact path now.
    pub fn restore(&mut self) -> Result<()> {
        let backup = self.take_backup()?;
        util::rename_replacing(&backup, &self.artifact)?;
        tracing::info!(
            target: "fleet.cache",
            path = %self.artifact.display(),
            "restored previous artifact"
        );
        Ok(())
    }

    /// Delete the stashed copy.
    pub fn discard(&mut self) -> Result<()> {
        let backup = self.take_backup()?;
        util::remove_file_idempotent(&backup)?;
        Ok(())
    }

    fn take_backup(&mut self) -> Result<PathBuf> {
        match std::mem::replace(&mut self.state, StashState::Idle) {
            StashState::Cached { backup } => Ok(backup),
            StashState::Idle => Err(CacheError::StashNotCached {
                path: self.artifact.clone(),
            }),
        }
    }

    fn backup_path(&self) -> PathBuf {
        let mut name: OsString = self.artifact.as_os_str().to_os_string();
        name.push(format!("{STASH_MARKER}{}", std::process::id()));
        PathBuf::from(name)
    }
}
