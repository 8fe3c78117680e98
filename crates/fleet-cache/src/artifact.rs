//! On-disk layout of a cache root.
//!
//! ```text
//! <root>/<Artifact>.<ext>
//! <root>/<Artifact>.<ext>.<hash>.hashcheck
//! <root>/<Artifact>.<ext>.LastUsed
//! <root>/<ResourceKey>.lock
//! <root>/MaxDirSize.txt
//! <root>/PurgeLog_<year>.txt
//! ```
//!
//! A primary artifact is a file whose extension is one of the configured artifact
//! extensions. Every other file in the same directory whose name starts with the
//! artifact's base name (the name without its final extension) is a companion, and is
//! deleted together with the artifact. When several primaries could claim a companion,
//! the one with the longest matching prefix wins, so `Foo.revCat.fasta.LastUsed` belongs
//! to `Foo.revCat.fasta` and not to `Foo.fasta`.

use crate::error::{CacheError, Result};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const LAST_USED_EXTENSION: &str = "LastUsed";
pub const HASHCHECK_EXTENSION: &str = "hashcheck";
pub const LOCK_EXTENSION: &str = "lock";
pub const QUOTA_MARKER_FILENAME: &str = "MaxDirSize.txt";
pub const PURGE_LOG_PREFIX: &str = "PurgeLog_";

pub fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CacheError::InvalidArtifactName {
            path: path.to_path_buf(),
        })
}

/// The name without its final extension (`Foo.revCat.fasta` -> `Foo.revCat`).
pub fn base_name(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

pub fn extension(name: &str) -> Option<&str> {
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn last_used_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, &format!(".{LAST_USED_EXTENSION}"))
}

pub fn lock_path(resource: &Path) -> PathBuf {
    with_suffix(resource, &format!(".{LOCK_EXTENSION}"))
}

pub fn hashcheck_path(artifact: &Path, hash: &str) -> PathBuf {
    with_suffix(artifact, &format!(".{hash}.{HASHCHECK_EXTENSION}"))
}

/// Extract the hash embedded in `<artifact_name>.<hash>.hashcheck`.
pub fn hashcheck_hash<'a>(artifact_name: &str, sidecar_name: &'a str) -> Option<&'a str> {
    let rest = strip_prefix_ignore_case(sidecar_name, artifact_name)?;
    let rest = rest.strip_prefix('.')?;
    let hash = strip_suffix_ignore_case(rest, &format!(".{HASHCHECK_EXTENSION}"))?;
    if hash.is_empty() || hash.contains('.') {
        return None;
    }
    Some(hash)
}

pub(crate) fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    let split = text.len().checked_sub(suffix.len())?;
    if text.is_char_boundary(split) && text[split..].eq_ignore_ascii_case(suffix) {
        Some(&text[..split])
    } else {
        None
    }
}

/// Names that belong to the cache machinery rather than to any artifact.
pub fn is_reserved_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(QUOTA_MARKER_FILENAME)
        || strip_prefix_ignore_case(name, PURGE_LOG_PREFIX).is_some()
        || extension(name).is_some_and(|ext| ext.eq_ignore_ascii_case(LOCK_EXTENSION))
        || name.contains(crate::util::TMP_MARKER)
        || name.contains(crate::stash::STASH_MARKER)
}

/// The file name a crash leftover (stash backup or temp file) was made for.
pub fn leftover_owner(name: &str) -> Option<&str> {
    [crate::stash::STASH_MARKER, crate::util::TMP_MARKER]
        .iter()
        .find_map(|marker| name.find(marker).map(|idx| &name[..idx]))
        .filter(|owner| !owner.is_empty())
}

/// One regular file seen during a directory scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

/// A single read of one directory's regular files.
#[derive(Clone, Debug, Default)]
pub struct DirListing {
    pub dir: PathBuf,
    pub files: Vec<ListedFile>,
}

impl DirListing {
    pub fn read(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    dir: dir.to_path_buf(),
                    files,
                })
            }
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(
                        target: "fleet.cache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to read directory entry"
                    );
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let path = entry.path();
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    // Another worker may have just deleted it.
                    if err.kind() != io::ErrorKind::NotFound {
                        tracing::debug!(
                            target: "fleet.cache",
                            path = %path.display(),
                            error = %err,
                            "failed to stat directory entry"
                        );
                    }
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            files.push(ListedFile {
                name,
                path,
                size_bytes: meta.len(),
                modified: meta.modified().ok(),
                created: meta.created().ok(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ListedFile> {
        self.files
            .iter()
            .find(|file| file.name.eq_ignore_ascii_case(name))
    }

    /// Hashcheck sidecars (`<artifact_name>.<hash>.hashcheck`) for `artifact_name`.
    pub fn hashchecks_for<'a>(
        &'a self,
        artifact_name: &'a str,
    ) -> impl Iterator<Item = &'a ListedFile> + 'a {
        self.files
            .iter()
            .filter(move |file| hashcheck_hash(artifact_name, &file.name).is_some())
    }
}

/// A primary artifact plus the companion files deleted along with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactGroup {
    pub path: PathBuf,
    pub name: String,
    pub base_name: String,
    pub companions: Vec<PathBuf>,
    /// Artifact plus companions.
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
}

/// Recognises primary artifacts and groups their companions.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    extensions: Vec<String>,
}

impl ArtifactLayout {
    pub fn new(extensions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_primary(&self, name: &str) -> bool {
        if is_reserved_name(name) {
            return false;
        }
        let Some(ext) = extension(name) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    }

    /// Group one directory's files into artifacts.
    pub fn groups_in(&self, listing: &DirListing) -> Vec<ArtifactGroup> {
        let primaries: Vec<&ListedFile> = listing
            .files
            .iter()
            .filter(|file| self.is_primary(&file.name))
            .collect();

        let mut groups: Vec<ArtifactGroup> = primaries
            .iter()
            .map(|file| ArtifactGroup {
                path: file.path.clone(),
                name: file.name.clone(),
                base_name: base_name(&file.name).to_string(),
                companions: Vec::new(),
                size_bytes: file.size_bytes,
                modified: file.modified,
            })
            .collect();

        for file in &listing.files {
            if self.is_primary(&file.name) || is_reserved_name(&file.name) {
                continue;
            }
            let owner = groups
                .iter()
                .enumerate()
                .filter_map(|(idx, group)| {
                    claim_length(&file.name, &group.name, &group.base_name).map(|len| (idx, len))
                })
                .max_by_key(|&(_, len)| len)
                .map(|(idx, _)| idx);
            if let Some(idx) = owner {
                let group = &mut groups[idx];
                group.companions.push(file.path.clone());
                group.size_bytes = group.size_bytes.saturating_add(file.size_bytes);
            }
        }

        groups
    }

    /// Stash backups and temp files left behind by crashed workers, one group per file.
    ///
    /// A leftover whose owner still has a `.lock` in the same directory belongs to a
    /// generation or copy in progress and is not listed.
    pub fn leftovers_in(&self, listing: &DirListing) -> Vec<ArtifactGroup> {
        listing
            .files
            .iter()
            .filter_map(|file| {
                let owner = leftover_owner(&file.name)?;
                if listing.get(&format!("{owner}.{LOCK_EXTENSION}")).is_some() {
                    return None;
                }
                Some(ArtifactGroup {
                    path: file.path.clone(),
                    name: file.name.clone(),
                    base_name: file.name.clone(),
                    companions: Vec::new(),
                    size_bytes: file.size_bytes,
                    modified: file.modified,
                })
            })
            .collect()
    }

    /// Every artifact group under `root`, visiting each directory exactly once.
    pub fn enumerate(&self, root: &Path) -> Result<Vec<ArtifactGroup>> {
        Ok(listings(root)?
            .iter()
            .flat_map(|listing| self.groups_in(listing))
            .collect())
    }
}

/// One [`DirListing`] per directory under `root` (inclusive), without following symlinks.
pub fn listings(root: &Path) -> Result<Vec<DirListing>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let vanished = err
                    .io_error()
                    .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound);
                if !vanished {
                    tracing::debug!(
                        target: "fleet.cache",
                        error = %err,
                        "failed to walk cache directory while enumerating artifacts"
                    );
                }
                continue;
            }
        };
        if entry.file_type().is_dir() {
            out.push(DirListing::read(entry.path())?);
        }
    }
    Ok(out)
}

/// Length of the prefix by which `companion` would belong to the given primary.
fn claim_length(companion: &str, primary_name: &str, primary_base: &str) -> Option<usize> {
    for prefix in [primary_name, primary_base] {
        if let Some(rest) = strip_prefix_ignore_case(companion, prefix) {
            if rest.starts_with('.') {
                return Some(prefix.len());
            }
        }
    }
    None
}
