//! Job Orchestrator and `GlobalControl` (distilled spec §4.6): sequences
//! pools within a job, opens cluster handles, aggregates status; owns the
//! ordered list of jobs and the "one run at a time" guard.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{Config, JobConfig};
use crate::pool;
use crate::rbd::ClusterHandle;
use crate::status::{StatusHandle, StatusTree, StatusType};
use crate::zfs::ZfsContext;

/// A fully-resolved job: cluster params plus the pools to mirror.
pub struct Job {
    pub name: String,
    pub cluster: ClusterHandle,
    pub pools: Vec<ResolvedPool>,
}

pub struct ResolvedPool {
    pub ceph_pool_name: String,
    pub zfs_destination: String,
    pub filter: crate::filter::ImageFilter,
}

impl Job {
    pub fn from_config(config: &JobConfig) -> Result<Self, crate::error::ConfigError> {
        let mut pools = Vec::with_capacity(config.pools.len());
        for pool_config in &config.pools {
            pools.push(ResolvedPool {
                ceph_pool_name: pool_config.ceph_pool_name.clone(),
                zfs_destination: pool_config.zfs_destination.clone(),
                filter: pool_config.build_filter()?,
            });
        }
        Ok(Job {
            name: config.name.clone(),
            cluster: ClusterHandle::new(
                config.cluster.auth_name.clone(),
                config.cluster.conf_file.clone(),
                config.cluster.cluster_name.clone(),
            ),
            pools,
        })
    }

    /// Run every pool sequentially (§4.6 step 2), aggregating status onto
    /// the job node via invariant 4.
    async fn run(&self, job_status: StatusHandle) {
        job_status.log_status(
            format!("Starting job {:?}", self.name),
            Some(StatusType::InProgress),
        );

        for pool in &self.pools {
            let pool_status = job_status.make_or_replace_child(pool.ceph_pool_name.clone(), true);
            let pool_ctx = self.cluster.open_pool(&pool.ceph_pool_name);
            let zfs_base = ZfsContext::new(pool.zfs_destination.clone());

            if let Err(err) = pool::run_pool(pool_status.clone(), pool_ctx, zfs_base, &pool.filter).await
            {
                pool_status.log_status(format!("{err}"), Some(StatusType::Failed));
            }
        }

        job_status.set_status_type(StatusType::Success);
    }
}

/// Owns the ordered list of jobs and the shared status tree; exposes a
/// non-blocking "run all" affordance that rejects overlapping runs
/// (§4.6, "GlobalControl").
pub struct GlobalControl {
    jobs: Vec<Job>,
    status_tree: Arc<StatusTree>,
    run_lock: Mutex<()>,
}

impl GlobalControl {
    pub fn from_config(config: &Config) -> Result<Self, crate::error::ConfigError> {
        let mut jobs = Vec::with_capacity(config.jobs.len());
        for job_config in &config.jobs {
            jobs.push(Job::from_config(job_config)?);
        }
        Ok(GlobalControl {
            jobs,
            status_tree: StatusTree::new("ceph2zfs"),
            run_lock: Mutex::new(()),
        })
    }

    pub fn status_tree(&self) -> &Arc<StatusTree> {
        &self.status_tree
    }

    /// Run every job sequentially (§4.6). Returns `false` without doing
    /// any work if a run is already in progress.
    pub async fn run_all(&self) -> bool {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return false;
        };

        let root = self.status_tree.root();
        for job in &self.jobs {
            let job_status = root.make_or_replace_child(job.name.clone(), true);
            job.run(job_status).await;
        }
        root.set_status_type(StatusType::Success);
        true
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_from_config_resolves_filter() {
        let raw = r#"
name = "test"

[cluster]

[[pools]]
ceph_pool_name = "vmstorage"
zfs_destination = "testpool/ceph-img-test"
image_filter = { regex = "^vm-" }
"#;
        let config: JobConfig = toml::from_str(raw).unwrap();
        let job = Job::from_config(&config).unwrap();
        assert_eq!(job.pools.len(), 1);
        assert!(job.pools[0].filter.should_backup("vm-101"));
        assert!(!job.pools[0].filter.should_backup("ct-101"));
    }
}
