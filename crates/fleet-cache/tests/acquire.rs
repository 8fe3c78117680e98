use fleet_cache::{
    artifact, find_hashchecks, write_hashcheck, AcquireKind, AcquireOptions, ArtifactCache,
    CacheConfig, CacheError, DiskSpace, FixedClock, GenerateError, GenerationProgress, Generator,
    LocalTransport, ReconcileOutcome, RemoteTarget, ReplicaStatus, ReplicaSynchronizer,
    ValidationOutcome, VolumeStats, BYTES_PER_MB,
};
use filetime::{set_file_mtime, FileTime};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Produces `<name>.fasta` containing a fixed protein record.
#[derive(Default)]
struct ProteinExport {
    calls: AtomicUsize,
    size_hint: Option<u64>,
}

impl Generator for ProteinExport {
    fn expected_artifact_name(&self, name: &str) -> String {
        format!("{name}.fasta")
    }

    fn estimated_size_bytes(&self, _name: &str) -> Option<u64> {
        self.size_hint
    }

    fn generate(
        &self,
        name: &str,
        dir: &Path,
        progress: &GenerationProgress,
    ) -> Result<(), GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.update(50.0, "writing records");
        let file = self.expected_artifact_name(name);
        std::fs::write(dir.join(&file), format!(">{name}\nMKTAYIAKQR\n"))
            .map_err(|err| GenerateError::Failed(err.to_string()))?;
        progress.complete(file);
        Ok(())
    }
}

/// Reports a fixed free-space figure, lowered by whatever is deleted from the share.
#[derive(Debug)]
struct TightVolume {
    root: std::path::PathBuf,
    free_at_start: u64,
    used_at_start: Mutex<Option<u64>>,
}

impl VolumeStats for TightVolume {
    fn disk_space(&self, _path: &Path) -> io::Result<DiskSpace> {
        let used = fleet_cache::dir_size_bytes_nofollow(&self.root);
        let mut start = self.used_at_start.lock().unwrap();
        let start = *start.get_or_insert(used);
        Ok(DiskSpace {
            free_bytes: self.free_at_start + start.saturating_sub(used),
            total_bytes: 100 * BYTES_PER_MB,
        })
    }
}

fn config(root: &Path) -> CacheConfig {
    let mut config = CacheConfig::new(root);
    config.worker = "pub-05".to_string();
    config.lock_poll_interval = Duration::from_millis(20);
    config.generator_retry_backoff = vec![Duration::ZERO, Duration::ZERO];
    config
}

#[test]
fn acquire_generates_then_replicates_and_hits() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("fasta");
    std::fs::create_dir_all(&root).unwrap();
    let remote = RemoteTarget::new("pub-06", tmp.path().join("remote"));

    let volume = Arc::new(TightVolume {
        root: root.clone(),
        free_at_start: 80 * BYTES_PER_MB,
        used_at_start: Mutex::new(None),
    });
    let cache = ArtifactCache::with_parts(
        config(&root),
        Arc::new(FixedClock::new(SystemTime::now())),
        volume,
    )
    .with_replica(
        ReplicaSynchronizer::new(Arc::new(LocalTransport::default())),
        remote.clone(),
    );
    let generator = ProteinExport::default();

    let first = cache
        .acquire("Ecoli_K12", &generator, AcquireOptions::default())
        .unwrap();
    assert_eq!(first.kind, AcquireKind::Generated);
    assert_eq!(first.path, root.join("Ecoli_K12.fasta"));
    assert_eq!(
        first.replica,
        Some(ReplicaStatus::Synced {
            outcome: ReconcileOutcome::Copied
        })
    );
    assert!(remote.dir.join("Ecoli_K12.fasta").exists());
    assert_eq!(cache.validate(&first.path).unwrap(), ValidationOutcome::Valid);

    let second = cache
        .acquire("Ecoli_K12", &generator, AcquireOptions::default())
        .unwrap();
    assert_eq!(second.kind, AcquireKind::Hit);
    assert_eq!(
        second.replica,
        Some(ReplicaStatus::Synced {
            outcome: ReconcileOutcome::UpToDate
        })
    );
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn acquire_makes_room_but_never_evicts_its_own_target() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let now = SystemTime::now() + 365 * DAY;

    // A valid copy of the target and an unrelated artifact, both well past the floor.
    let target = root.join("Human.fasta");
    std::fs::write(&target, vec![b'M'; 4 * BYTES_PER_MB as usize]).unwrap();
    let sidecar = write_hashcheck(&target, now - 60 * DAY).unwrap();
    let other = root.join("Rat.fasta");
    std::fs::write(&other, vec![b'M'; 4 * BYTES_PER_MB as usize]).unwrap();
    for path in [&target, &other, &sidecar] {
        set_file_mtime(path, FileTime::from_system_time(now - 60 * DAY)).unwrap();
    }

    let volume = Arc::new(TightVolume {
        root: root.clone(),
        free_at_start: 8 * BYTES_PER_MB,
        used_at_start: Mutex::new(None),
    });
    let cache = ArtifactCache::with_parts(config(&root), Arc::new(FixedClock::new(now)), volume);
    let generator = ProteinExport {
        size_hint: Some(BYTES_PER_MB),
        ..ProteinExport::default()
    };

    let outcome = cache
        .acquire("Human", &generator, AcquireOptions::default())
        .unwrap();

    assert_eq!(outcome.kind, AcquireKind::Hit);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    assert!(target.exists());
    assert!(!other.exists());
    assert_eq!(find_hashchecks(&target).unwrap().len(), 1);
    assert!(artifact::last_used_path(&target).exists());
}

#[test]
fn mismatch_outside_the_holdoff_fails_without_regenerating() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let now = SystemTime::now();

    let target = root.join("Human.fasta");
    std::fs::write(&target, ">Human\ncorrupted\n").unwrap();
    let sidecar = artifact::hashcheck_path(&target, "0011");
    std::fs::write(&sidecar, "hash=0011\n").unwrap();
    set_file_mtime(&sidecar, FileTime::from_system_time(now - Duration::from_secs(72 * 3600)))
        .unwrap();

    let cache = ArtifactCache::with_parts(
        config(&root),
        Arc::new(FixedClock::new(now)),
        Arc::new(TightVolume {
            root: root.clone(),
            free_at_start: 90 * BYTES_PER_MB,
            used_at_start: Mutex::new(None),
        }),
    );
    let generator = ProteinExport::default();

    let err = cache
        .acquire("Human", &generator, AcquireOptions::default())
        .unwrap_err();

    assert!(
        matches!(err, CacheError::HashMismatch { ref expected, .. } if expected == "0011"),
        "{err}"
    );
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        ">Human\ncorrupted\n"
    );
    assert!(sidecar.exists());
    assert!(!artifact::last_used_path(&target).exists());
    assert!(!artifact::lock_path(&target).exists());
}

#[test]
fn collision_with_a_live_lock_is_reported_not_swallowed() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.lock_max_wait = Duration::from_millis(200);
    let cache = ArtifactCache::with_parts(
        config,
        Arc::new(FixedClock::new(SystemTime::now())),
        Arc::new(TightVolume {
            root: tmp.path().to_path_buf(),
            free_at_start: 90 * BYTES_PER_MB,
            used_at_start: Mutex::new(None),
        }),
    );

    // Another worker holds the lock for longer than we are willing to wait; the lock is
    // deleted as abandoned and generation proceeds.
    let held = cache
        .locks()
        .acquire(&tmp.path().join("Human.fasta"), "pub-01 generating Human.fasta")
        .unwrap();
    let outcome = cache
        .acquire("Human", &ProteinExport::default(), AcquireOptions::default())
        .unwrap();
    assert_eq!(outcome.kind, AcquireKind::Generated);
    drop(held);

    // Without waiting, a held lock is a hard collision.
    let _held = cache
        .locks()
        .acquire(&tmp.path().join("Mouse.fasta"), "pub-01")
        .unwrap();
    let err = cache
        .locks()
        .acquire(&tmp.path().join("Mouse.fasta"), "pub-05")
        .unwrap_err();
    assert!(matches!(err, CacheError::LockHeld { .. }));
}
