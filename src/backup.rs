//! Image Backup Procedure (distilled spec §4.4): the per-image algorithm
//! that reconciles source/destination snapshot histories, pins a source
//! snapshot, prepares the destination volume, streams the diff into the
//! destination block device, and finalizes with a matching snapshot.

use chrono::Utc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{BackupError, CopyError, ExtentFailure, FinalizeError};
use crate::rbd::Image;
use crate::status::{StatusHandle, StatusType};
use crate::zfs::ZfsDatasetContext;

/// Outcome counters surviving past the procedure, for logging/tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStats {
    pub requested_bytes: u64,
    pub written_bytes: u64,
    pub failed_extents: u64,
}

/// `latest_common` := the last element, in destination order, of the
/// intersection of source and destination snapshot names (§4.4 step 1-2,
/// P1).
pub fn select_basis(source_names: &[String], destination_names_ordered: &[String]) -> Option<String> {
    destination_names_ordered
        .iter()
        .rev()
        .find(|name| source_names.iter().any(|s| s == *name))
        .cloned()
}

fn snapshot_name(now: chrono::DateTime<Utc>) -> String {
    format!("ctz-{}", now.format("%Y-%m-%d-%H:%M:%S"))
}

/// Run the full procedure for one image, mutating `status` to its
/// terminal outcome. Never returns an `Err` to the caller for a failed
/// backup — per-image errors are caught here (§4.5, §7 "Propagation")
/// and recorded on the status node instead.
pub async fn run(
    status: StatusHandle,
    mut image: Image,
    dest: &ZfsDatasetContext,
) -> Result<(), BackupError> {
    status.log_status("Enumerating snapshots", Some(StatusType::Preparing));

    let source_snaps = image.list_snaps().await?;
    let source_names: Vec<String> = source_snaps.iter().map(|s| s.name.clone()).collect();

    let dest_path = dest.zfs_path();
    let destination_names: Vec<String> = if dest
        .exists()
        .await
        .map_err(crate::error::PreparationError::from)?
    {
        dest.snapshots()
            .await
            .map_err(crate::error::PreparationError::from)?
            .into_iter()
            .map(|s| s.short_name)
            .collect()
    } else {
        Vec::new()
    };

    let basis = select_basis(&source_names, &destination_names);
    status.log(format!("Selected basis snapshot: {basis:?}"));

    let new_name = snapshot_name(Utc::now());

    status.log_status(
        format!("Creating source snapshot {new_name}"),
        Some(StatusType::Preparing),
    );
    image.create_snap(&new_name).await?;
    image.set_snap(new_name.clone());

    let required_size = image.size().await?;

    status.log_status("Preparing destination volume", Some(StatusType::Preparing));
    dest.prepare(basis.as_deref(), required_size).await?;

    status.log_status("Copying changed extents", Some(StatusType::InProgress));
    let stats = match copy_diff(&image, dest, basis.as_deref()).await {
        Ok(stats) => stats,
        Err(err) => {
            status.log_status(
                format!("Copy failed: {err}"),
                Some(StatusType::Failed),
            );
            return Err(BackupError::Copy(err));
        }
    };
    status.log(format!(
        "Copied {}/{} bytes",
        stats.written_bytes, stats.requested_bytes
    ));

    status.log_status("Finalizing destination snapshot", Some(StatusType::Finishing));
    if let Err(source) = dest.snapshot(&new_name).await {
        let err = FinalizeError::Snapshot {
            dataset: dest_path,
            name: new_name,
            source,
        };
        status.log_status(format!("Finalize failed: {err}"), Some(StatusType::Failed));
        return Err(BackupError::Finalize(err));
    }

    status.log_status(format!("Backup complete as {new_name}"), Some(StatusType::Success));
    Ok(())
}

/// §4.4 step 8: drive the RBD differential iterator and write every
/// reported extent into the destination device. Aborts (does not
/// snapshot) on the first extent failure, matching the source's
/// "log and re-raise" behavior.
async fn copy_diff(
    image: &Image,
    dest: &ZfsDatasetContext,
    basis: Option<&str>,
) -> Result<CopyStats, CopyError> {
    let device_path = dest.device_node();
    let mut device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .await
        .map_err(|source| CopyError::OpenDevice {
            path: device_path,
            source,
        })?;

    let extents = image.diff_iterate(basis).await?;
    let mut exported = image.export_to_file().await?;

    let mut stats = CopyStats::default();
    let mut failures = Vec::new();

    // Every reported extent is read and written, regardless of `exists`:
    // the exported snapshot carries zero bytes for unallocated regions,
    // so writing them unconditionally reproduces the pinned source
    // exactly instead of leaving stale destination bytes behind.
    for extent in extents {
        stats.requested_bytes += extent.length;

        let result: Result<(), std::io::Error> = async {
            let bytes = exported.read_range(extent.offset, extent.length).await?;
            device
                .seek(std::io::SeekFrom::Start(extent.offset))
                .await?;
            device.write_all(&bytes).await?;
            device.flush().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => stats.written_bytes += extent.length,
            Err(source) => {
                tracing::warn!(
                    offset = extent.offset,
                    end = extent.offset + extent.length,
                    "extent write failed"
                );
                failures.push(ExtentFailure {
                    offset: extent.offset,
                    end: extent.offset + extent.length,
                    source,
                });
                break;
            }
        }
    }

    device.flush().await.ok();
    drop(device);

    stats.failed_extents = failures.len() as u64;
    if !failures.is_empty() {
        return Err(CopyError::Extents {
            written: stats.written_bytes,
            requested: stats.requested_bytes,
            failures,
        });
    }

    Ok(stats)
}
