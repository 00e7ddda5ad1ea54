//! Pool Worker Pool (distilled spec §4.5): bounded-parallelism execution
//! of per-image backup procedures with isolated per-task failure.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backup;
use crate::filter::ImageFilter;
use crate::rbd::PoolContext;
use crate::status::{StatusHandle, StatusType};
use crate::zfs::ZfsContext;

/// Concurrency is intentionally low: each task drives high-throughput
/// block I/O against one shared cluster and destination pool; more
/// workers degrades throughput rather than improving it (§4.5).
const MAX_CONCURRENT_IMAGES: usize = 2;

/// Enumerate images in `pool_ctx`, filter them, and run one backup
/// procedure per survivor with at most [`MAX_CONCURRENT_IMAGES`] running
/// at once. A failing image never aborts its siblings.
pub async fn run_pool(
    status: StatusHandle,
    pool_ctx: PoolContext,
    zfs_base: ZfsContext,
    filter: &ImageFilter,
) -> Result<(), crate::error::RbdError> {
    status.log_status("Listing images", Some(StatusType::InProgress));
    let all_images = pool_ctx.list_images().await?;
    let selected: Vec<String> = all_images
        .into_iter()
        .filter(|name| filter.should_backup(name))
        .collect();

    status.log(format!("{} image(s) selected for backup", selected.len()));

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_IMAGES));
    let mut tasks = JoinSet::new();

    for image_name in selected {
        let permit = Arc::clone(&semaphore);
        let image_status = status.make_or_replace_child(image_name.clone(), true);
        let image = pool_ctx.open_image(image_name.clone());
        let dest = zfs_base.dataset(&image_name);

        tasks.spawn(run_one(permit, image_status, image, dest));
    }

    while tasks.join_next().await.is_some() {}

    status.set_status_type(StatusType::Success);
    Ok(())
}

/// Wrap one image's procedure so a panic or error updates its own status
/// node and never propagates to the pool (§4.5, §7 "Propagation").
async fn run_one(
    semaphore: Arc<Semaphore>,
    status: StatusHandle,
    image: crate::rbd::Image,
    dest: crate::zfs::ZfsDatasetContext,
) {
    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
    if let Err(err) = backup::run(status, image, &dest).await {
        status.log_status(format!("{err}"), Some(StatusType::Failed));
    }
}
