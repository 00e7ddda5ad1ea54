//! Error taxonomy for the backup engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML configuration: {0}")]
    InvalidToml(#[from] toml::de::Error),
    #[error("invalid regex in image filter {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid cron expression {0:?}")]
    InvalidCron(String),
    #[error("invalid retention duration {0:?}")]
    InvalidDuration(String),
    #[error("configuration has no jobs")]
    EmptyJobList,
    #[error("job {0:?} has no pools")]
    EmptyPoolList(String),
    #[error("job {job:?} pool {pool:?} has an empty zfs_destination")]
    EmptyZfsDestination { job: String, pool: String },
}

/// Errors encountered while preparing a destination zvol (§4.3).
#[derive(Debug, Error)]
pub enum PreparationError {
    #[error("dataset for {path:?} exists but is not a volume")]
    NotAVolume { path: String },
    #[error("dataset {path:?} has no snapshot named {name:?}")]
    BasisNotFound { path: String, name: String },
    #[error("zfs command failed: {0}")]
    Zfs(#[from] ZfsError),
}

/// A single failed extent during the differential copy (§4.4 step 8).
#[derive(Debug, Error)]
#[error("write failed for extent [{offset}, {end}): {source}")]
pub struct ExtentFailure {
    pub offset: u64,
    pub end: u64,
    #[source]
    pub source: std::io::Error,
}

/// Errors raised by the differential copy itself.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to open destination device {path:?}: {source}")]
    OpenDevice {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{} extent write(s) failed; wrote {written}/{requested} bytes", failures.len())]
    Extents {
        written: u64,
        requested: u64,
        failures: Vec<ExtentFailure>,
    },
    #[error("rbd command failed: {0}")]
    Rbd(#[from] RbdError),
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("failed to create destination snapshot {dataset:?}@{name:?}: {source}")]
    Snapshot {
        dataset: String,
        name: String,
        #[source]
        source: ZfsError,
    },
}

/// Top-level error for one image's backup procedure.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Rbd(#[from] RbdError),
    #[error(transparent)]
    Preparation(#[from] PreparationError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

#[derive(Debug, Error)]
pub enum ZfsError {
    #[error("zfs command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("failed to spawn zfs: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("could not parse zfs output: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum RbdError {
    #[error("rbd command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("failed to spawn rbd: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("could not parse rbd output: {0}")]
    Parse(#[from] serde_json::Error),
}
