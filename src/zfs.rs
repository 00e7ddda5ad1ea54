//! ZFS facade (distilled spec §4.2): lookup/create/resize/rollback/snapshot
//! operations on a zvol tree, shelling out to the `zfs` command line tool
//! in the same style the teacher program uses (`tokio::process::Command`,
//! parsing `-H` tab-separated output).
//!
//! Subprocess invocation sits behind the [`ZfsRunner`] trait seam so the
//! facade and `ZfsDatasetContext::prepare` can be exercised in tests
//! against a fake command layer instead of a live ZFS pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::error::ZfsError;

static ZFS: &str = "zfs";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The seam between the facade and the actual `zfs` binary: "run this
/// `zfs` subcommand, return its stdout or an error".
pub trait ZfsRunner: std::fmt::Debug + Send + Sync {
    fn run(&self, args: Vec<String>) -> BoxFuture<'_, Result<String, ZfsError>>;
}

#[derive(Debug, Default)]
struct SystemZfsRunner;

impl ZfsRunner for SystemZfsRunner {
    fn run(&self, args: Vec<String>) -> BoxFuture<'_, Result<String, ZfsError>> {
        Box::pin(async move {
            let output = Command::new(ZFS).args(&args).output().await?;
            if !output.status.success() {
                return Err(ZfsError::CommandFailed {
                    command: format!("{ZFS} {}", args.join(" ")),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetType {
    Volume,
    Filesystem,
    Snapshot,
    Other,
}

impl DatasetType {
    fn parse(value: &str) -> DatasetType {
        match value {
            "volume" => DatasetType::Volume,
            "filesystem" => DatasetType::Filesystem,
            "snapshot" => DatasetType::Snapshot,
            _ => DatasetType::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The substring after the `@` (§4.2, "Snapshot short-name").
    pub short_name: String,
    pub creation: DateTime<Utc>,
}

async fn run(runner: &dyn ZfsRunner, args: &[&str]) -> Result<String, ZfsError> {
    runner.run(args.iter().map(|s| s.to_string()).collect()).await
}

async fn run_status(runner: &dyn ZfsRunner, args: &[&str]) -> Result<(), ZfsError> {
    run(runner, args).await.map(|_| ())
}

/// Does the dataset at this full path exist at all (any type)?
pub async fn exists(runner: &dyn ZfsRunner, full_path: &str) -> Result<bool, ZfsError> {
    match run(runner, &["list", "-H", "-o", "name", full_path]).await {
        Ok(_) => Ok(true),
        Err(ZfsError::CommandFailed { stderr, .. }) if stderr.contains("does not exist") => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// `child(base, name)` (§4.2): does `{base}/{name}` exist?
pub async fn child(
    runner: &dyn ZfsRunner,
    base: &str,
    name: &str,
) -> Result<Option<String>, ZfsError> {
    let full = format!("{base}/{name}");
    if exists(runner, &full).await? {
        Ok(Some(full))
    } else {
        Ok(None)
    }
}

/// Create a sparse zvol at `{base}/{name}` with `volsize = size_bytes`.
pub async fn create_child_volume(
    runner: &dyn ZfsRunner,
    base: &str,
    name: &str,
    size_bytes: u64,
) -> Result<String, ZfsError> {
    let full = format!("{base}/{name}");
    run_status(runner, &["create", "-s", "-V", &size_bytes.to_string(), &full]).await?;
    Ok(full)
}

pub async fn dataset_type(runner: &dyn ZfsRunner, full_path: &str) -> Result<DatasetType, ZfsError> {
    let out = run(runner, &["get", "-H", "-o", "value", "type", full_path]).await?;
    Ok(DatasetType::parse(out.trim()))
}

pub async fn volsize(runner: &dyn ZfsRunner, full_path: &str) -> Result<u64, ZfsError> {
    let out = run(runner, &["get", "-Hp", "-o", "value", "volsize", full_path]).await?;
    out.trim()
        .parse()
        .map_err(|_| ZfsError::Parse(format!("invalid volsize {:?}", out.trim())))
}

/// Grow-only resize, per the "no destructive operation" contract (§4.2):
/// shrinking `volsize` is never attempted.
pub async fn set_volsize(
    runner: &dyn ZfsRunner,
    full_path: &str,
    size_bytes: u64,
) -> Result<(), ZfsError> {
    let current = volsize(runner, full_path).await?;
    if size_bytes < current {
        return Err(ZfsError::CommandFailed {
            command: format!("zfs set volsize={size_bytes} {full_path}"),
            stderr: format!("refusing to shrink volsize from {current} to {size_bytes}"),
        });
    }
    if size_bytes == current {
        return Ok(());
    }
    run_status(runner, &["set", &format!("volsize={size_bytes}"), full_path]).await
}

/// Ordered list of child snapshots, sorted by creation time ascending
/// (§3, "Destination dataset").
pub async fn snapshots(runner: &dyn ZfsRunner, full_path: &str) -> Result<Vec<Snapshot>, ZfsError> {
    let out = run(
        runner,
        &[
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation", "-d", "1", full_path,
        ],
    )
    .await?;

    let mut result = Vec::new();
    for line in out.lines() {
        let fields: Vec<_> = line.split('\t').collect();
        if fields.len() != 2 {
            continue;
        }
        let short_name = fields[0]
            .rsplit('@')
            .next()
            .unwrap_or(fields[0])
            .to_string();
        let secs: i64 = fields[1]
            .parse()
            .map_err(|_| ZfsError::Parse(format!("invalid creation time {:?}", fields[1])))?;
        let creation = DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| ZfsError::Parse(format!("invalid timestamp {secs}")))?;
        result.push(Snapshot {
            short_name,
            creation,
        });
    }
    result.sort_by_key(|s| s.creation);
    Ok(result)
}

pub async fn snapshot(runner: &dyn ZfsRunner, full_path: &str, name: &str) -> Result<(), ZfsError> {
    run_status(runner, &["snapshot", &format!("{full_path}@{name}")]).await
}

pub async fn rollback(runner: &dyn ZfsRunner, full_path: &str, name: &str) -> Result<(), ZfsError> {
    run_status(runner, &["rollback", &format!("{full_path}@{name}")]).await
}

/// A pool-scoped destination root, e.g. `testpool/ceph-img-test` (§3,
/// "Destination dataset", §6 `zfs_destination`).
#[derive(Debug, Clone)]
pub struct ZfsContext {
    pub base: String,
    runner: Arc<dyn ZfsRunner>,
}

impl ZfsContext {
    pub fn new(base: impl Into<String>) -> Self {
        ZfsContext {
            base: base.into(),
            runner: Arc::new(SystemZfsRunner),
        }
    }

    /// Construct a context backed by a fake [`ZfsRunner`], for tests
    /// (§14 "Test Tooling").
    pub fn with_runner(base: impl Into<String>, runner: Arc<dyn ZfsRunner>) -> Self {
        ZfsContext {
            base: base.into(),
            runner,
        }
    }

    pub fn dataset(&self, image_name: &str) -> ZfsDatasetContext {
        ZfsDatasetContext {
            base: self.base.clone(),
            name: image_name.to_string(),
            runner: Arc::clone(&self.runner),
            device_node_override: None,
        }
    }
}

/// Operations scoped to one image's destination dataset, `{base}/{name}`.
/// Wraps the free functions above the way `ZfsDatasetContext` wraps
/// `libzfs` calls in the original implementation.
#[derive(Debug, Clone)]
pub struct ZfsDatasetContext {
    base: String,
    name: String,
    runner: Arc<dyn ZfsRunner>,
    /// Overrides the `/dev/zvol/...` path `prepare` polls/opens, for
    /// tests that stand a plain file in for a block device.
    device_node_override: Option<String>,
}

impl ZfsDatasetContext {
    pub fn zfs_path(&self) -> String {
        format!("{}/{}", self.base, self.name)
    }

    pub fn device_node(&self) -> String {
        self.device_node_override
            .clone()
            .unwrap_or_else(|| format!("/dev/zvol/{}", self.zfs_path()))
    }

    #[cfg(test)]
    pub fn with_device_node_override(mut self, path: impl Into<String>) -> Self {
        self.device_node_override = Some(path.into());
        self
    }

    /// Does this dataset exist at all (any type)?
    pub async fn exists(&self) -> Result<bool, ZfsError> {
        exists(self.runner.as_ref(), &self.zfs_path()).await
    }

    /// This dataset's child snapshots, ordered by creation time (§3).
    pub async fn snapshots(&self) -> Result<Vec<Snapshot>, ZfsError> {
        snapshots(self.runner.as_ref(), &self.zfs_path()).await
    }

    /// Create a snapshot of this dataset named `name` (§4.4 step 11).
    pub async fn snapshot(&self, name: &str) -> Result<(), ZfsError> {
        snapshot(self.runner.as_ref(), &self.zfs_path(), name).await
    }

    /// `prepare(basis_name_or_none, required_size)` (§4.3).
    pub async fn prepare(
        &self,
        basis: Option<&str>,
        required_size: u64,
    ) -> Result<(), crate::error::PreparationError> {
        use crate::error::PreparationError;

        let runner = self.runner.as_ref();
        let existing = child(runner, &self.base, &self.name).await?;
        let full_path = match existing {
            None => {
                let created =
                    create_child_volume(runner, &self.base, &self.name, required_size).await?;
                wait_for_device_node(&self.device_node()).await;
                created
            }
            Some(full_path) => {
                if dataset_type(runner, &full_path).await? != DatasetType::Volume {
                    return Err(PreparationError::NotAVolume { path: full_path });
                }
                full_path
            }
        };

        if let Some(basis_name) = basis {
            let present = snapshots(runner, &full_path)
                .await?
                .iter()
                .any(|s| s.short_name == basis_name);
            if !present {
                return Err(PreparationError::BasisNotFound {
                    path: full_path,
                    name: basis_name.to_string(),
                });
            }
            rollback(runner, &full_path, basis_name).await?;
        }

        let current_size = volsize(runner, &full_path).await?;
        if current_size < required_size {
            set_volsize(runner, &full_path, required_size).await?;
        }

        Ok(())
    }
}

/// Poll for the device node's existence at 500ms intervals (§4.3 step 2):
/// device-node creation by the kernel/udev is asynchronous relative to the
/// ZFS command's return.
async fn wait_for_device_node(path: &str) {
    while tokio::fs::metadata(path).await.is_err() {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
pub mod test_support {
    //! A fake [`ZfsRunner`] standing in for a live `zfs` binary (§14
    //! "Test Tooling"), scripted per-subcommand so `prepare` and the
    //! scenarios in §8 can be exercised without a live pool.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Canned state for one dataset: whether (and as what type) it
    /// exists, its `volsize`, and its snapshots. `create`/`set`/
    /// `snapshot`/`rollback` mutate this state so `prepare` sees its own
    /// effects, the way a real `zfs` pool would.
    #[derive(Clone)]
    pub struct FakeDataset {
        pub dataset_type: DatasetType,
        pub volsize: u64,
        pub snapshots: Vec<Snapshot>,
    }

    pub struct FakeZfsRunner {
        datasets: Mutex<HashMap<String, FakeDataset>>,
    }

    impl std::fmt::Debug for FakeZfsRunner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FakeZfsRunner").finish()
        }
    }

    impl FakeZfsRunner {
        pub fn new() -> Self {
            FakeZfsRunner {
                datasets: Mutex::new(HashMap::new()),
            }
        }

        pub fn seed(&self, path: impl Into<String>, dataset: FakeDataset) {
            self.datasets.lock().unwrap().insert(path.into(), dataset);
        }

        pub fn volsize_of(&self, path: &str) -> u64 {
            self.datasets.lock().unwrap()[path].volsize
        }

        pub fn snapshot_names_of(&self, path: &str) -> Vec<String> {
            self.datasets.lock().unwrap()[path]
                .snapshots
                .iter()
                .map(|s| s.short_name.clone())
                .collect()
        }
    }

    fn at(args: &[String], flag: &str) -> bool {
        args.iter().any(|a| a == flag)
    }

    impl ZfsRunner for FakeZfsRunner {
        fn run(&self, args: Vec<String>) -> BoxFuture<'_, Result<String, ZfsError>> {
            Box::pin(async move {
                let mut datasets = self.datasets.lock().unwrap();
                match args[0].as_str() {
                    "list" if at(&args, "snapshot") => {
                        let path = args.last().unwrap();
                        let ds = datasets.get(path.as_str());
                        let lines: String = ds
                            .map(|d| {
                                d.snapshots
                                    .iter()
                                    .map(|s| format!("{path}@{}\t{}", s.short_name, s.creation.timestamp()))
                                    .collect::<Vec<_>>()
                                    .join("\n")
                            })
                            .unwrap_or_default();
                        Ok(lines)
                    }
                    "list" => {
                        let path = args.last().unwrap();
                        if datasets.contains_key(path.as_str()) {
                            Ok(path.clone())
                        } else {
                            Err(ZfsError::CommandFailed {
                                command: "zfs list".to_string(),
                                stderr: format!("cannot open '{path}': dataset does not exist"),
                            })
                        }
                    }
                    "create" => {
                        let path = args.last().unwrap().clone();
                        let vsize: u64 = args
                            .iter()
                            .position(|a| a == "-V")
                            .and_then(|i| args.get(i + 1))
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0);
                        datasets.insert(
                            path,
                            FakeDataset {
                                dataset_type: DatasetType::Volume,
                                volsize: vsize,
                                snapshots: Vec::new(),
                            },
                        );
                        Ok(String::new())
                    }
                    "get" if at(&args, "type") => {
                        let path = args.last().unwrap();
                        Ok(match datasets.get(path.as_str()).map(|d| d.dataset_type) {
                            Some(DatasetType::Volume) => "volume".to_string(),
                            Some(DatasetType::Filesystem) => "filesystem".to_string(),
                            _ => "filesystem".to_string(),
                        })
                    }
                    "get" if at(&args, "volsize") => {
                        let path = args.last().unwrap();
                        Ok(datasets
                            .get(path.as_str())
                            .map(|d| d.volsize.to_string())
                            .unwrap_or_default())
                    }
                    "set" => {
                        let path = args.last().unwrap().clone();
                        let assignment = &args[1];
                        if let Some(value) = assignment.strip_prefix("volsize=") {
                            if let Ok(value) = value.parse::<u64>() {
                                if let Some(ds) = datasets.get_mut(&path) {
                                    ds.volsize = value;
                                }
                            }
                        }
                        Ok(String::new())
                    }
                    "snapshot" => {
                        let full = args.last().unwrap();
                        let (path, name) = full.split_once('@').unwrap();
                        if let Some(ds) = datasets.get_mut(path) {
                            ds.snapshots.push(Snapshot {
                                short_name: name.to_string(),
                                creation: Utc::now(),
                            });
                        }
                        Ok(String::new())
                    }
                    "rollback" => Ok(String::new()),
                    _ => Ok(String::new()),
                }
            })
        }
    }
}
