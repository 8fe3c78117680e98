use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fleet_cache::{
    format_rfc3339, write_hashcheck, ArtifactCache, CacheConfig, CacheError, DiskSpace,
    EvictionReport, LocalTransport, QuotaPolicy, RemoteTarget, ReplicaSynchronizer,
    ValidationOutcome, WaitOutcome, BYTES_PER_MB,
};
use fleet_config::FleetConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Parser)]
#[command(
    name = "fleet-cache",
    version,
    about = "Shared artifact cache maintenance (eviction, locks, hashchecks, replicas)"
)]
struct Cli {
    /// Path to a `fleet.toml` config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Cache root (overrides the config file and `FLEET_CACHE_DIR`)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Emit JSON suitable for scripts
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evict least-recently-used artifacts under the root's policy
    Purge(PurgeArgs),
    /// Show the root's policy, volume space and artifacts by usage age
    Status,
    /// Print an artifact's effective last-used time
    LastUsed(ArtifactArgs),
    /// Record a use of an artifact in its `.LastUsed` sidecar
    Touch(ArtifactArgs),
    /// Wait until no lock file guards a resource, removing it once stale
    WaitLock(WaitLockArgs),
    /// Fingerprint an artifact and write its hashcheck sidecar
    Hashcheck(ArtifactArgs),
    /// Check an artifact against its hashcheck sidecar (exit 1 when invalid)
    Validate(ArtifactArgs),
    /// Bring the copy on another host in line with the local artifact
    Replicate(ReplicateArgs),
}

#[derive(Args)]
struct PurgeArgs {
    /// Also free at least this many MB (free-space policy only)
    #[arg(long, default_value_t = 0)]
    required_mb: u64,
    /// Report what would be deleted without deleting anything
    #[arg(long)]
    preview: bool,
}

#[derive(Args)]
struct ArtifactArgs {
    /// Artifact path (relative paths are resolved against the cache root)
    artifact: PathBuf,
}

#[derive(Args)]
struct WaitLockArgs {
    /// Resource whose `<resource>.lock` to wait on
    resource: PathBuf,
    /// Override the configured maximum wait, in minutes
    #[arg(long)]
    max_wait_minutes: Option<u64>,
    /// Free-form description included in progress logs
    #[arg(long, default_value = "fleet-cache wait-lock")]
    description: String,
}

#[derive(Args)]
struct ReplicateArgs {
    /// Artifact path (relative paths are resolved against the cache root)
    artifact: PathBuf,
    /// Name of the remote host, for logs and reports
    #[arg(long)]
    host: String,
    /// Directory of the remote copy, as mounted on this machine
    #[arg(long)]
    remote_dir: PathBuf,
    /// Only report whether the remote copy is up to date (exit 1 when it is not)
    #[arg(long)]
    check: bool,
    /// Overwrite a smaller remote copy without waiting for an in-flight copy
    #[arg(long)]
    no_wait: bool,
    /// How long to wait for an in-flight copy, in seconds
    #[arg(long, default_value_t = 30 * 60)]
    convergence_timeout_secs: u64,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let fleet = match &cli.config {
        Some(path) => FleetConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FleetConfig::default(),
    };
    fleet_config::init_tracing(&fleet.logging);

    let mut config = fleet.cache_config();
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    tracing::debug!(
        target: "fleet.cli",
        root = %config.root.display(),
        worker = %config.worker,
        "resolved cache config"
    );

    match cli.command {
        Command::Purge(args) => {
            if args.preview {
                config.preview = true;
            }
            let cache = ArtifactCache::new(config);
            let report = cache.purge(args.required_mb)?;
            print_purge_report(&report, cli.json)?;
            Ok(if report.target_met() { 0 } else { 1 })
        }
        Command::Status => {
            let cache = ArtifactCache::new(config);
            let status = collect_status(&cache)?;
            print_status(&status, cli.json)?;
            Ok(0)
        }
        Command::LastUsed(args) => {
            let cache = ArtifactCache::new(config);
            let path = resolve(cache.root(), &args.artifact);
            let last_used = cache.usage().effective_last_used(&path)?;
            let age = SystemTime::now()
                .duration_since(last_used)
                .unwrap_or_default();
            let report = LastUsedReport {
                path,
                last_used: format_rfc3339(last_used),
                age_secs: age.as_secs(),
            };
            if cli.json {
                print_json(&report)?;
            } else {
                println!("{}", report.last_used);
            }
            Ok(0)
        }
        Command::Touch(args) => {
            let cache = ArtifactCache::new(config);
            let path = resolve(cache.root(), &args.artifact);
            if !path.is_file() {
                bail!("no such artifact: {}", path.display());
            }
            cache.usage().touch(&path, SystemTime::now())?;
            print_ok(&path, "touched", cli.json)?;
            Ok(0)
        }
        Command::WaitLock(args) => {
            let cache = ArtifactCache::new(config);
            let mut locks = cache.locks().clone();
            if let Some(minutes) = args.max_wait_minutes {
                locks = locks.with_max_wait(Duration::from_secs(minutes.saturating_mul(60)));
            }
            let resource = resolve(cache.root(), &args.resource);
            let outcome = locks.wait_for_clear(&resource, &args.description)?;
            let report = WaitReport::new(resource, &outcome);
            if cli.json {
                print_json(&report)?;
            } else {
                println!("{}: {}", report.resource.display(), report.outcome);
            }
            Ok(0)
        }
        Command::Hashcheck(args) => {
            let cache = ArtifactCache::new(config);
            let path = resolve(cache.root(), &args.artifact);
            let sidecar = write_hashcheck(&path, SystemTime::now())?;
            if cli.json {
                print_json(&serde_json::json!({ "path": path, "sidecar": sidecar }))?;
            } else {
                println!("{}", sidecar.display());
            }
            Ok(0)
        }
        Command::Validate(args) => {
            let cache = ArtifactCache::new(config);
            let path = resolve(cache.root(), &args.artifact);
            let report = match cache.validate(&path) {
                Ok(ValidationOutcome::Valid) => ValidateReport::new(path, "valid", None),
                Ok(ValidationOutcome::NotYetReverified { expected, found }) => {
                    ValidateReport::new(
                        path,
                        "not_yet_reverified",
                        Some(format!("expected {expected}, found {found}")),
                    )
                }
                Err(
                    err @ (CacheError::MissingHashcheck { .. } | CacheError::HashMismatch { .. }),
                ) => ValidateReport::new(path, "invalid", Some(err.to_string())),
                Err(err) => return Err(err.into()),
            };
            let exit = if report.status == "invalid" { 1 } else { 0 };
            if cli.json {
                print_json(&report)?;
            } else {
                match &report.detail {
                    Some(detail) => {
                        println!("{}: {} ({detail})", report.path.display(), report.status)
                    }
                    None => println!("{}: {}", report.path.display(), report.status),
                }
            }
            Ok(exit)
        }
        Command::Replicate(args) => replicate(config, args, cli.json),
    }
}

fn replicate(config: CacheConfig, args: ReplicateArgs, json: bool) -> Result<i32> {
    let cache = ArtifactCache::new(config);
    let path = resolve(cache.root(), &args.artifact);
    let transport = LocalTransport::new(cache.locks().clone());
    let sync = ReplicaSynchronizer::new(Arc::new(transport))
        .with_convergence_timeout(Duration::from_secs(args.convergence_timeout_secs));
    let remote = RemoteTarget::new(args.host, args.remote_dir);

    if args.check {
        let up_to_date = sync.is_up_to_date(&path, &remote)?;
        if json {
            print_json(&serde_json::json!({
                "path": path,
                "remote": remote.to_string(),
                "up_to_date": up_to_date,
            }))?;
        } else if up_to_date {
            println!("{}: up to date on {remote}", path.display());
        } else {
            println!("{}: out of date on {remote}", path.display());
        }
        return Ok(if up_to_date { 0 } else { 1 });
    }

    let outcome = sync.reconcile(&path, &remote, !args.no_wait)?;
    if json {
        print_json(&serde_json::json!({
            "path": path,
            "remote": remote.to_string(),
            "outcome": outcome,
        }))?;
    } else {
        println!("{}: {outcome:?} on {remote}", path.display());
    }
    Ok(0)
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Serialize)]
struct StatusReport {
    root: PathBuf,
    policy: QuotaPolicy,
    disk: DiskSpace,
    total_bytes: u64,
    artifacts: Vec<ArtifactStatus>,
}

#[derive(Serialize)]
struct ArtifactStatus {
    name: String,
    path: PathBuf,
    size_bytes: u64,
    companions: usize,
    last_used: String,
    age_days: f64,
}

fn collect_status(cache: &ArtifactCache) -> Result<StatusReport> {
    let root = cache.root();
    let policy = QuotaPolicy::for_root(root, cache.config().clamped_threshold_percent(), 0);
    let disk = fleet_cache::disk_space(root)?;
    let total_bytes = fleet_cache::dir_size_bytes_nofollow(root);
    let artifacts = cache
        .planner()
        .candidates(root)?
        .into_iter()
        .map(|candidate| ArtifactStatus {
            name: candidate.group.name,
            path: candidate.group.path,
            size_bytes: candidate.group.size_bytes,
            companions: candidate.group.companions.len(),
            last_used: format_rfc3339(candidate.last_used),
            age_days: candidate.age.as_secs_f64() / 86_400.0,
        })
        .collect();
    Ok(StatusReport {
        root: root.to_path_buf(),
        policy,
        disk,
        total_bytes,
        artifacts,
    })
}

#[derive(Serialize)]
struct LastUsedReport {
    path: PathBuf,
    last_used: String,
    age_secs: u64,
}

#[derive(Serialize)]
struct WaitReport {
    resource: PathBuf,
    outcome: &'static str,
    /// Time spent polling, or the age of the removed stale lock.
    secs: u64,
}

impl WaitReport {
    fn new(resource: PathBuf, outcome: &WaitOutcome) -> Self {
        let (outcome, secs) = match outcome {
            WaitOutcome::Clear => ("clear", 0),
            WaitOutcome::Released { waited } => ("released", waited.as_secs()),
            WaitOutcome::StaleRemoved { age } => ("stale_removed", age.as_secs()),
        };
        Self {
            resource,
            outcome,
            secs,
        }
    }
}

#[derive(Serialize)]
struct ValidateReport {
    path: PathBuf,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ValidateReport {
    fn new(path: PathBuf, status: &'static str, detail: Option<String>) -> Self {
        Self {
            path,
            status,
            detail,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}

fn print_ok(path: &Path, action: &str, json: bool) -> Result<()> {
    if json {
        print_json(&serde_json::json!({ "ok": true, "path": path }))
    } else {
        println!("{action}: {}", path.display());
        Ok(())
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB as f64
}

fn print_purge_report(report: &EvictionReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    match report.policy {
        QuotaPolicy::TotalSize { max_size_gb } => {
            println!("policy: total size <= {max_size_gb} GB");
            println!(
                "  dir_size_mb: {:.2} -> {:.2}",
                mb(report.before_bytes),
                mb(report.after_bytes)
            );
        }
        QuotaPolicy::FreeSpace {
            threshold_percent,
            required_free_mb,
        } => {
            println!("policy: free space >= {threshold_percent}% (+{required_free_mb} MB)");
            println!(
                "  free_mb: {:.2} -> {:.2}",
                mb(report.before_bytes),
                mb(report.after_bytes)
            );
        }
    }
    if report.preview {
        println!("  preview: nothing was deleted");
    }
    for evicted in &report.deleted {
        println!(
            "  evicted: {} ({:.2} MB, {:.1} days unused)",
            evicted.path.display(),
            mb(evicted.size_bytes),
            evicted.age_secs as f64 / 86_400.0
        );
    }
    println!("  freed_mb: {:.2}", mb(report.freed_bytes));
    if report.failed_deletes > 0 {
        println!("  failed_deletes: {}", report.failed_deletes);
    }
    if report.floor_hit {
        println!("  stopped at the minimum eviction age");
    }
    if !report.target_met() {
        println!("  shortfall_mb: {:.2}", mb(report.shortfall_bytes));
    }
    Ok(())
}

fn print_status(status: &StatusReport, json: bool) -> Result<()> {
    if json {
        return print_json(status);
    }

    println!("cache:");
    println!("  root: {}", status.root.display());
    match status.policy {
        QuotaPolicy::TotalSize { max_size_gb } => {
            println!("  policy: total size <= {max_size_gb} GB")
        }
        QuotaPolicy::FreeSpace {
            threshold_percent, ..
        } => println!("  policy: free space >= {threshold_percent}%"),
    }
    println!(
        "  volume: {:.2} MB free of {:.2} MB ({:.1}%)",
        mb(status.disk.free_bytes),
        mb(status.disk.total_bytes),
        status.disk.free_percent()
    );
    println!("  dir_size_mb: {:.2}", mb(status.total_bytes));
    println!("  artifacts: {}", status.artifacts.len());
    for artifact in &status.artifacts {
        println!(
            "    {:>8.1}d  {:>10.2} MB  {}",
            artifact.age_days,
            mb(artifact.size_bytes),
            artifact.name
        );
    }
    Ok(())
}
