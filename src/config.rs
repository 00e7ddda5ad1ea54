//! Declarative configuration (distilled spec §6, resolving the open
//! question of concrete file format): one or more jobs, each naming a
//! Ceph cluster and the pools to mirror out of it.

use cron::Schedule;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::filter::{ImageFilter, ImageFilterConfig};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    pub fn try_from(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::EmptyJobList);
        }
        for job in &self.jobs {
            if job.pools.is_empty() {
                return Err(ConfigError::EmptyPoolList(job.name.clone()));
            }
            for pool in &job.pools {
                if pool.zfs_destination.trim().is_empty() {
                    return Err(ConfigError::EmptyZfsDestination {
                        job: job.name.clone(),
                        pool: pool.ceph_pool_name.clone(),
                    });
                }
                pool.image_filter.build()?;
            }
        }
        if let Some(schedule) = &self.daemon.schedule {
            to_cron(schedule)?;
        }
        Ok(())
    }
}

/// One backup job: a cluster handle plus the pools to mirror out of it
/// (§3 "Job", §4.6).
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub cluster: CephClusterConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

/// Ceph cluster connection parameters (§3 "Cluster handle", §6).
#[derive(Debug, Deserialize)]
pub struct CephClusterConfig {
    #[serde(default = "default_auth_name")]
    pub auth_name: String,
    #[serde(default = "default_conf_file")]
    pub conf_file: String,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
}

fn default_auth_name() -> String {
    "client.admin".to_string()
}

fn default_conf_file() -> String {
    "/etc/ceph/ceph.conf".to_string()
}

fn default_cluster_name() -> String {
    "ceph".to_string()
}

/// One pool to mirror, and where its images land in ZFS (§3 "Pool
/// config", §6).
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub ceph_pool_name: String,
    pub zfs_destination: String,
    #[serde(default)]
    pub image_filter: ImageFilterConfig,
}

impl PoolConfig {
    pub fn build_filter(&self) -> Result<ImageFilter, ConfigError> {
        self.image_filter.build()
    }
}

/// Optional scheduled-daemon settings (§12).
#[derive(Debug, Deserialize, Default)]
pub struct DaemonConfig {
    pub schedule: Option<String>,
}

impl DaemonConfig {
    pub fn cron_schedule(&self) -> Option<Result<Schedule, ConfigError>> {
        self.schedule.as_deref().map(to_cron)
    }
}

fn to_cron(expression: &str) -> Result<Schedule, ConfigError> {
    Schedule::try_from(expression).map_err(|_| ConfigError::InvalidCron(expression.to_string()))
}
