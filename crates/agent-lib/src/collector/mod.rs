//! Workload usage collection
//!
//! This module reads per-workload resource counters from the cgroup v1
//! accounting hierarchy, locates the workloads placed on this host and
//! drives periodic sampling across all of them.

mod cgroup_v1;
mod discovery;
mod r#loop;


pub use cgroup_v1::{
    cpu_percent, CgroupUsageReader, ClockTickError, ClockTicks, DEFAULT_CPUACCT_ROOT,
    DEFAULT_MEMORY_ROOT,
};
pub use discovery::{system_hostname, HostnameResolver, WorkloadLocator};
pub use r#loop::{
    CollectionConfig, CollectionScheduler, CollectionSchedulerBuilder, CpuPercentCache,
    SchedulerHandle, SchedulerState,
};

use crate::models::{CpuUsageSample, MemoryUsageSample};
use std::path::PathBuf;
use thiserror::Error;

pub use async_trait::async_trait;

/// Failure to read one metric for one workload
#[derive(Debug, Error)]
pub enum UsageError {
    /// The accounting directory is gone; the workload has terminated
    #[error("accounting directory {path} not found for workload {workload_id}")]
    NotFound { workload_id: String, path: PathBuf },
    #[error("malformed counter file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UsageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, UsageError::NotFound { .. })
    }
}

/// Source of per-workload usage samples
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Read cumulative CPU accounting for a workload
    async fn read_cpu_usage(&self, workload_id: &str) -> Result<CpuUsageSample, UsageError>;

    /// Read memory accounting for a workload
    async fn read_memory_usage(&self, workload_id: &str) -> Result<MemoryUsageSample, UsageError>;
}
