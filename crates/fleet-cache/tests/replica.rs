use fleet_cache::{
    artifact, write_hashcheck, CacheError, LocalTransport, LockCoordinator, ReconcileOutcome,
    RemoteTarget, ReplicaSynchronizer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct Hosts {
    _tmp: TempDir,
    artifact: PathBuf,
    sidecar: PathBuf,
    remote: RemoteTarget,
}

impl Hosts {
    fn new(contents: &[u8]) -> Self {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        let remote = tmp.path().join("remote");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&remote).unwrap();

        let artifact = local.join("Yeast.fasta");
        std::fs::write(&artifact, contents).unwrap();
        let sidecar = write_hashcheck(&artifact, SystemTime::now()).unwrap();
        Self {
            _tmp: tmp,
            artifact,
            sidecar,
            remote: RemoteTarget::new("pub-11", remote),
        }
    }

    fn remote_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.remote.dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn sidecar_name(&self) -> String {
        file_name(&self.sidecar)
    }

    fn remote_names(&self) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(&self.remote.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().to_string()
}

fn sync() -> ReplicaSynchronizer {
    let transport = LocalTransport::new(
        LockCoordinator::default().with_poll_interval(Duration::from_millis(20)),
    )
    .with_poll_interval(Duration::from_millis(20))
    .with_stall_timeout(Duration::from_millis(200));
    ReplicaSynchronizer::new(Arc::new(transport)).with_convergence_timeout(Duration::from_secs(5))
}

#[test]
fn equal_size_but_different_sidecar_is_overwritten() {
    let hosts = Hosts::new(b">sp|Q1\nMSTNPKPQRK\n");
    let size = std::fs::metadata(&hosts.artifact).unwrap().len() as usize;
    hosts.remote_file("Yeast.fasta", &vec![b'X'; size]);
    let old_sidecar = hosts.remote_file("Yeast.fasta.0badc0de.hashcheck", b"");

    let outcome = sync().reconcile(&hosts.artifact, &hosts.remote, true).unwrap();

    assert_eq!(outcome, ReconcileOutcome::Copied);
    assert_eq!(
        std::fs::read(hosts.remote.dir.join("Yeast.fasta")).unwrap(),
        std::fs::read(&hosts.artifact).unwrap()
    );
    assert!(!old_sidecar.exists());
    assert_eq!(
        hosts.remote_names(),
        vec!["Yeast.fasta".to_string(), hosts.sidecar_name()]
    );
}

#[test]
fn matching_remote_is_left_alone() {
    let hosts = Hosts::new(b">sp|Q1\nMSTNPKPQRK\n");
    let size = std::fs::metadata(&hosts.artifact).unwrap().len() as usize;
    // Same size and sidecar name: contents are not compared.
    let remote = hosts.remote_file("Yeast.fasta", &vec![b'X'; size]);
    hosts.remote_file(&hosts.sidecar_name(), b"refreshed later");

    let outcome = sync().reconcile(&hosts.artifact, &hosts.remote, true).unwrap();

    assert_eq!(outcome, ReconcileOutcome::UpToDate);
    assert_eq!(std::fs::read(remote).unwrap(), vec![b'X'; size]);
}

#[test]
fn larger_remote_is_overwritten_without_waiting() {
    let hosts = Hosts::new(b"MSTNPKPQRK");
    hosts.remote_file("Yeast.fasta", b"a much longer and stale remote copy");

    let outcome = sync().reconcile(&hosts.artifact, &hosts.remote, true).unwrap();
    assert_eq!(outcome, ReconcileOutcome::Copied);
}

#[test]
fn stalled_smaller_remote_aborts() {
    let hosts = Hosts::new(b"MSTNPKPQRKTKRNTNRRPQDVKFPGG");
    hosts.remote_file("Yeast.fasta", b"MSTN");

    let err = sync()
        .reconcile(&hosts.artifact, &hosts.remote, true)
        .unwrap_err();
    assert!(matches!(err, CacheError::ReplicaAborted { .. }), "{err}");
    assert_eq!(
        std::fs::read(hosts.remote.dir.join("Yeast.fasta")).unwrap(),
        b"MSTN"
    );
}

#[test]
fn smaller_remote_is_copied_when_not_waiting() {
    let hosts = Hosts::new(b"MSTNPKPQRKTKRNTNRRPQDVKFPGG");
    hosts.remote_file("Yeast.fasta", b"MSTN");

    let outcome = sync()
        .reconcile(&hosts.artifact, &hosts.remote, false)
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Copied);
    assert!(!artifact::lock_path(&hosts.remote.dir.join("Yeast.fasta")).exists());
}

#[test]
fn in_flight_copy_that_finishes_converges() {
    let hosts = Hosts::new(b"MSTNPKPQRKTKRNTNRRPQDVKFPGG");
    let remote = hosts.remote_file("Yeast.fasta", b"MSTN");
    let full = std::fs::read(&hosts.artifact).unwrap();

    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        std::fs::write(&remote, full).unwrap();
    });
    let outcome = sync().reconcile(&hosts.artifact, &hosts.remote, true).unwrap();
    writer.join().unwrap();

    assert_eq!(outcome, ReconcileOutcome::Converged);
}

#[test]
fn artifact_without_sidecar_cannot_be_replicated() {
    let hosts = Hosts::new(b"MSTN");
    std::fs::remove_file(&hosts.sidecar).unwrap();

    let err = sync()
        .reconcile(&hosts.artifact, &hosts.remote, true)
        .unwrap_err();
    assert!(matches!(err, CacheError::MissingHashcheck { .. }));
    assert!(hosts.remote_names().is_empty());
}
