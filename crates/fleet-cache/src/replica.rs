//! Keeping a copy of an artifact on another host in step with the local one.
//!
//! Two copies match when their byte sizes are equal and their hashcheck sidecars have the
//! same file name. Sidecar contents are never compared: the sidecar is rewritten from time
//! to time without the artifact changing.

use crate::artifact::{self, HASHCHECK_EXTENSION};
use crate::error::{CacheError, Result};
use crate::hashcheck;
use crate::transport::{RemoteFileInfo, RemoteTarget, Transport};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// The replica match rule.
pub fn replica_matches(
    local_size: u64,
    local_sidecar: &str,
    remote_size: u64,
    remote_sidecar: &str,
) -> bool {
    local_size == remote_size && local_sidecar.eq_ignore_ascii_case(remote_sidecar)
}

/// The local side of a replica comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalReplica {
    pub name: String,
    pub size: u64,
    /// File name of the newest hashcheck sidecar.
    pub sidecar: String,
}

impl LocalReplica {
    /// Describe `artifact`; fails if it has no hashcheck sidecar.
    pub fn inspect(artifact: &Path) -> Result<Self> {
        let name = artifact::file_name(artifact)?.to_string();
        let size = std::fs::metadata(artifact)?.len();
        let newest = hashcheck::find_hashchecks(artifact)?
            .into_iter()
            .next()
            .ok_or_else(|| CacheError::MissingHashcheck {
                path: artifact.to_path_buf(),
            })?;
        let sidecar = artifact::file_name(&newest.path)?.to_string();
        Ok(Self {
            name,
            size,
            sidecar,
        })
    }

    fn remote_artifact<'a>(&self, remote: &'a [RemoteFileInfo]) -> Option<&'a RemoteFileInfo> {
        remote
            .iter()
            .find(|file| file.name.eq_ignore_ascii_case(&self.name))
    }

    fn remote_sidecars<'a>(
        &'a self,
        remote: &'a [RemoteFileInfo],
    ) -> impl Iterator<Item = &'a RemoteFileInfo> + 'a {
        remote.iter().filter(move |file| {
            artifact::extension(&file.name)
                .is_some_and(|ext| ext.eq_ignore_ascii_case(HASHCHECK_EXTENSION))
                && artifact::hashcheck_hash(&self.name, &file.name).is_some()
        })
    }
}

/// Whether the remote listing holds an up-to-date copy of `local`.
///
/// Needs both the remote artifact and a remote hashcheck sidecar; a missing one means
/// "not up to date".
pub fn is_up_to_date(local: &LocalReplica, remote: &[RemoteFileInfo]) -> bool {
    let Some(remote_artifact) = local.remote_artifact(remote) else {
        return false;
    };
    let mut sidecars = local.remote_sidecars(remote).peekable();
    if sidecars.peek().is_none() {
        return false;
    }
    sidecars.any(|sidecar| {
        replica_matches(local.size, &local.sidecar, remote_artifact.size, &sidecar.name)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    UpToDate,
    /// Another writer's in-flight copy finished while we waited.
    Converged,
    /// We overwrote the remote copy.
    Copied,
}

/// Drives [`Transport`] to bring remote copies in line with local artifacts.
#[derive(Clone, Debug)]
pub struct ReplicaSynchronizer {
    transport: Arc<dyn Transport>,
    convergence_timeout: Duration,
}

impl ReplicaSynchronizer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            convergence_timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_convergence_timeout(mut self, timeout: Duration) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    pub fn remote_listing(
        &self,
        local: &LocalReplica,
        remote: &RemoteTarget,
    ) -> Result<Vec<RemoteFileInfo>> {
        self.transport
            .list_remote(&remote.dir, &format!("{}*", globset_escape(&local.name)))
    }

    pub fn is_up_to_date(&self, artifact: &Path, remote: &RemoteTarget) -> Result<bool> {
        let local = LocalReplica::inspect(artifact)?;
        let listing = self.remote_listing(&local, remote)?;
        Ok(is_up_to_date(&local, &listing))
    }

    /// Make `remote` hold the same artifact and sidecar as `artifact`.
    ///
    /// The local copy is authoritative: a genuine mismatch is resolved by overwriting the
    /// remote one. A remote copy smaller than the local one may be someone else's copy in
    /// progress; with `wait_for_in_flight` we wait for it before deciding.
    pub fn reconcile(
        &self,
        artifact: &Path,
        remote: &RemoteTarget,
        wait_for_in_flight: bool,
    ) -> Result<ReconcileOutcome> {
        let local = LocalReplica::inspect(artifact)?;
        let listing = self
            .remote_listing(&local, remote)
            .map_err(|err| replica_error(artifact, remote, err))?;

        if is_up_to_date(&local, &listing) {
            tracing::debug!(
                target: "fleet.cache",
                path = %artifact.display(),
                remote = %remote,
                "remote copy is up to date"
            );
            return Ok(ReconcileOutcome::UpToDate);
        }

        if wait_for_in_flight {
            if let Some(remote_artifact) = local
                .remote_artifact(&listing)
                .filter(|file| file.size < local.size)
            {
                tracing::info!(
                    target: "fleet.cache",
                    path = %artifact.display(),
                    remote = %remote,
                    remote_size = remote_artifact.size,
                    local_size = local.size,
                    "remote copy is smaller; waiting for in-flight copy"
                );
                let convergence = self
                    .transport
                    .wait_for_convergence(
                        local.size,
                        &remote.dir,
                        remote_artifact,
                        self.convergence_timeout,
                    )
                    .map_err(|err| replica_error(artifact, remote, err))?;
                if convergence.abort {
                    return Err(CacheError::ReplicaAborted {
                        path: artifact.to_path_buf(),
                        remote: remote.to_string(),
                    });
                }
                if convergence.converged {
                    return Ok(ReconcileOutcome::Converged);
                }
            }
        }

        self.push(artifact, &local, &listing, remote)
            .map_err(|err| replica_error(artifact, remote, err))?;
        Ok(ReconcileOutcome::Copied)
    }

    fn push(
        &self,
        artifact: &Path,
        local: &LocalReplica,
        listing: &[RemoteFileInfo],
        remote: &RemoteTarget,
    ) -> Result<()> {
        let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
        // Artifact before sidecar: a matching sidecar must never describe a partial copy.
        self.transport
            .copy_file_with_lock(artifact, &remote.dir.join(&local.name))?;
        self.transport
            .copy_file_with_lock(&dir.join(&local.sidecar), &remote.dir.join(&local.sidecar))?;

        for stale in local.remote_sidecars(listing) {
            if !stale.name.eq_ignore_ascii_case(&local.sidecar) {
                self.transport.remove_remote(&remote.dir.join(&stale.name))?;
            }
        }

        tracing::info!(
            target: "fleet.cache",
            path = %artifact.display(),
            remote = %remote,
            size = local.size,
            "copied artifact to remote host"
        );
        Ok(())
    }
}

fn replica_error(artifact: &Path, remote: &RemoteTarget, err: CacheError) -> CacheError {
    match err {
        err @ (CacheError::ReplicaAborted { .. } | CacheError::Replica { .. }) => err,
        err => CacheError::Replica {
            path: artifact.to_path_buf(),
            remote: remote.to_string(),
            message: err.to_string(),
        },
    }
}

fn globset_escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '{' | '}' | '\\') {
            out.push('[');
            out.push(ch);
            out.push(']');
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    fn local() -> LocalReplica {
        LocalReplica {
            name: "Human.fasta".to_string(),
            size: 100,
            sidecar: "Human.fasta.aa11.hashcheck".to_string(),
        }
    }

    #[test]
    fn match_table() {
        let cases = [
            (100, "x.aa.hashcheck", 100, "x.aa.hashcheck", true),
            (100, "x.aa.hashcheck", 99, "x.aa.hashcheck", false),
            (100, "x.aa.hashcheck", 100, "x.bb.hashcheck", false),
            (100, "x.aa.hashcheck", 99, "x.bb.hashcheck", false),
        ];
        for (local_size, local_sidecar, remote_size, remote_sidecar, expected) in cases {
            assert_eq!(
                replica_matches(local_size, local_sidecar, remote_size, remote_sidecar),
                expected,
                "{local_size} {local_sidecar} vs {remote_size} {remote_sidecar}"
            );
        }
    }

    #[test]
    fn missing_remote_artifact_or_sidecar_is_not_up_to_date() {
        let local = local();
        assert!(!is_up_to_date(&local, &[]));
        assert!(!is_up_to_date(
            &local,
            &[RemoteFileInfo::new("Human.fasta", 100)]
        ));
        assert!(!is_up_to_date(
            &local,
            &[RemoteFileInfo::new("Human.fasta.aa11.hashcheck", 0)]
        ));
        assert!(is_up_to_date(
            &local,
            &[
                RemoteFileInfo::new("Human.fasta", 100),
                RemoteFileInfo::new("Human.fasta.aa11.hashcheck", 0),
            ]
        ));
    }

    #[test]
    fn sidecar_of_a_longer_name_does_not_count() {
        let local = local();
        assert!(!is_up_to_date(
            &local,
            &[
                RemoteFileInfo::new("Human.fasta", 100),
                RemoteFileInfo::new("Human.fasta.LastUsed", 20),
                RemoteFileInfo::new("Human.fasta.revCat.aa11.hashcheck", 0),
            ]
        ));
    }

    #[test]
    fn glob_metacharacters_in_names_are_escaped() {
        assert_eq!(globset_escape("a[1]*.fasta"), "a[[]1[]][*].fasta");
    }

    #[test]
    fn reconcile_copies_to_an_empty_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = tmp.path().join("local").join("Human.fasta");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"MKVLAAGIVALLLAAGCSS").unwrap();
        let sidecar = hashcheck::write_hashcheck(&artifact, std::time::SystemTime::now()).unwrap();

        let remote = RemoteTarget::new("pub-02", tmp.path().join("remote"));
        let sync = ReplicaSynchronizer::new(Arc::new(LocalTransport::default()));
        assert_eq!(
            sync.reconcile(&artifact, &remote, true).unwrap(),
            ReconcileOutcome::Copied
        );
        assert!(remote.dir.join("Human.fasta").exists());
        assert!(remote.dir.join(sidecar.file_name().unwrap()).exists());

        assert_eq!(
            sync.reconcile(&artifact, &remote, true).unwrap(),
            ReconcileOutcome::UpToDate
        );
    }
}
