//! Derives an artifact's "last used" time from several weak signals on disk.

use crate::artifact::{self, DirListing, ListedFile};
use crate::error::Result;
use crate::util;
use std::path::Path;
use std::time::SystemTime;

/// The individual usage signals found for one artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageSignals {
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    /// Newest modify time among the artifact's hashcheck sidecars.
    pub hashcheck_modified: Option<SystemTime>,
    /// Timestamp stored inside `<artifact>.LastUsed`.
    pub last_used_marker: Option<SystemTime>,
    /// Signals folded in from the base artifact of a derived name.
    pub alias: Option<SystemTime>,
}

impl UsageSignals {
    /// Maximum of all available signals.
    pub fn effective(&self) -> Option<SystemTime> {
        [
            self.modified,
            self.created,
            self.hashcheck_modified,
            self.last_used_marker,
            self.alias,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

#[derive(Clone, Debug, Default)]
pub struct UsageTracker {
    alias_suffixes: Vec<String>,
}

impl UsageTracker {
    pub fn new(alias_suffixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            alias_suffixes: alias_suffixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Effective last-used time of `artifact`; reads its directory once.
    pub fn effective_last_used(&self, artifact: &Path) -> Result<SystemTime> {
        let name = artifact::file_name(artifact)?;
        let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
        let listing = DirListing::read(dir)?;
        let signals = self.signals_in(&listing, name);
        match signals.effective() {
            Some(when) => Ok(when),
            None => {
                // Not in the listing: surface the stat error (usually NotFound).
                let meta = std::fs::metadata(artifact)?;
                Ok(meta.modified()?)
            }
        }
    }

    pub fn effective_last_used_in(&self, listing: &DirListing, name: &str) -> Option<SystemTime> {
        self.signals_in(listing, name).effective()
    }

    /// Collect every signal for `name` from an existing directory listing.
    pub fn signals_in(&self, listing: &DirListing, name: &str) -> UsageSignals {
        let mut signals = sidecar_signals(listing, name);
        if let Some(file) = listing.get(name) {
            signals.modified = file.modified;
            signals.created = file.created;
        }

        if let Some(base) = self.alias_base_name(name) {
            let base_signals = sidecar_signals(listing, &base);
            signals.alias = [base_signals.hashcheck_modified, base_signals.last_used_marker]
                .into_iter()
                .flatten()
                .max();
        }

        signals
    }

    /// For a derived name like `Foo.revCat.fasta`, the base artifact `Foo.fasta`.
    pub fn alias_base_name(&self, name: &str) -> Option<String> {
        let stem = artifact::base_name(name);
        let ext = artifact::extension(name);
        self.alias_suffixes.iter().find_map(|suffix| {
            let split = stem.len().checked_sub(suffix.len())?;
            if split == 0
                || !stem.is_char_boundary(split)
                || !stem[split..].eq_ignore_ascii_case(suffix)
            {
                return None;
            }
            let base = &stem[..split];
            Some(match ext {
                Some(ext) => format!("{base}.{ext}"),
                None => base.to_string(),
            })
        })
    }

    /// Refresh the `.LastUsed` sidecar for `artifact` to `now`.
    pub fn touch(&self, artifact: &Path, now: SystemTime) -> Result<()> {
        let sidecar = artifact::last_used_path(artifact);
        let line = format!("{}\n", util::format_rfc3339(now));
        util::atomic_write(&sidecar, line.as_bytes())?;
        tracing::debug!(
            target: "fleet.cache",
            path = %sidecar.display(),
            "refreshed last-used marker"
        );
        Ok(())
    }
}

fn sidecar_signals(listing: &DirListing, name: &str) -> UsageSignals {
    let hashcheck_modified = listing
        .hashchecks_for(name)
        .filter_map(|file| file.modified)
        .max();

    let marker_name = format!("{name}.{}", artifact::LAST_USED_EXTENSION);
    let last_used_marker = listing.get(&marker_name).and_then(read_last_used_marker);

    UsageSignals {
        hashcheck_modified,
        last_used_marker,
        ..UsageSignals::default()
    }
}

fn read_last_used_marker(file: &ListedFile) -> Option<SystemTime> {
    let text = match std::fs::read_to_string(&file.path) {
        Ok(text) => text,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target: "fleet.cache",
                    path = %file.path.display(),
                    error = %err,
                    "failed to read last-used marker"
                );
            }
            return None;
        }
    };
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    match util::parse_timestamp(line) {
        Ok(when) => Some(when),
        Err(err) => {
            // Fall back to the marker's own modify time; it was written when last used.
            tracing::debug!(
                target: "fleet.cache",
                path = %file.path.display(),
                error = %err,
                "unparseable last-used marker"
            );
            file.modified
        }
    }
}
