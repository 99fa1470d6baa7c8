//! cgroup v1 usage accounting
//!
//! Reads per-workload counters from the legacy cgroup v1 hierarchy:
//! - cpuacct controller for cumulative CPU time
//! - memory controller for current, peak and limit usage
//!
//! Every workload owns one directory per controller, named after its
//! identifier, directly below the configured controller root.

use super::{UsageError, UsageSource};
use crate::models::{CpuUsageSample, MemoryUsageSample};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_CPUACCT_ROOT: &str = "/cgroup/cpuacct/openshift";
pub const DEFAULT_MEMORY_ROOT: &str = "/cgroup/memory/openshift";

const CPUACCT_STAT: &str = "cpuacct.stat";
const CPUACCT_USAGE: &str = "cpuacct.usage";
const CPUACCT_USAGE_PERCPU: &str = "cpuacct.usage_percpu";
const MEMORY_USAGE: &str = "memory.usage_in_bytes";
const MEMORY_MAX_USAGE: &str = "memory.max_usage_in_bytes";
const MEMORY_LIMIT: &str = "memory.limit_in_bytes";

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Clock ticks could not be resolved to a usable value
#[derive(Debug, Error)]
#[error("invalid clock ticks per second: {0}")]
pub struct ClockTickError(pub i64);

/// Kernel clock ticks per second (USER_HZ), used to scale `cpuacct.stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTicks(u64);

impl ClockTicks {
    pub fn new(per_second: u64) -> Result<Self, ClockTickError> {
        if per_second == 0 {
            return Err(ClockTickError(0));
        }
        Ok(Self(per_second))
    }

    /// Query the running kernel via `sysconf(_SC_CLK_TCK)`
    pub fn from_system() -> Result<Self, ClockTickError> {
        // SAFETY: sysconf has no side effects and is thread-safe for this query.
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz <= 0 {
            return Err(ClockTickError(hz as i64));
        }
        Self::new(hz as u64)
    }

    pub fn per_second(&self) -> u64 {
        self.0
    }

    /// Convert a tick count to nanoseconds
    pub fn to_nanos(&self, ticks: u64) -> u64 {
        let nanos = ticks as u128 * NANOS_PER_SECOND as u128 / self.0 as u128;
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

/// Reader for workload accounting directories under cgroup v1
pub struct CgroupUsageReader {
    /// Root of the per-workload cpuacct directories
    cpuacct_root: PathBuf,
    /// Root of the per-workload memory directories
    memory_root: PathBuf,
    clock_ticks: ClockTicks,
}

impl CgroupUsageReader {
    pub fn new(
        cpuacct_root: impl Into<PathBuf>,
        memory_root: impl Into<PathBuf>,
        clock_ticks: ClockTicks,
    ) -> Self {
        Self {
            cpuacct_root: cpuacct_root.into(),
            memory_root: memory_root.into(),
            clock_ticks,
        }
    }

    /// Reader on the default roots with the system clock tick rate
    pub fn with_defaults() -> Result<Self, ClockTickError> {
        Ok(Self::new(
            DEFAULT_CPUACCT_ROOT,
            DEFAULT_MEMORY_ROOT,
            ClockTicks::from_system()?,
        ))
    }

    pub fn clock_ticks(&self) -> ClockTicks {
        self.clock_ticks
    }

    /// Parse `cpuacct.stat` into (user, system) nanoseconds
    ///
    /// The file holds exactly `user <ticks>` followed by `system <ticks>`.
    pub fn parse_cpuacct_stat(content: &str, ticks: ClockTicks) -> Result<(u64, u64), String> {
        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(format!("expected 4 fields, found {}", fields.len()));
        }
        if fields[0] != "user" {
            return Err(format!("unexpected field {:?}, expected \"user\"", fields[0]));
        }
        if fields[2] != "system" {
            return Err(format!(
                "unexpected field {:?}, expected \"system\"",
                fields[2]
            ));
        }

        let user = parse_u64(fields[1])?;
        let system = parse_u64(fields[3])?;

        Ok((ticks.to_nanos(user), ticks.to_nanos(system)))
    }

    /// Parse `cpuacct.usage_percpu` into one counter per logical CPU
    pub fn parse_percpu(content: &str) -> Result<Vec<u64>, String> {
        content.split_whitespace().map(parse_u64).collect()
    }

    /// Parse a file holding a single unsigned counter
    pub fn parse_counter(content: &str) -> Result<u64, String> {
        parse_u64(content.trim())
    }

    /// Read a counter file, mapping a vanished workload to `NotFound`
    async fn read_file(
        &self,
        workload_id: &str,
        dir: &Path,
        name: &str,
    ) -> Result<String, UsageError> {
        let path = dir.join(name);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if fs::metadata(dir).await.is_err() {
                    Err(UsageError::NotFound {
                        workload_id: workload_id.to_string(),
                        path: dir.to_path_buf(),
                    })
                } else {
                    Err(UsageError::Parse {
                        path,
                        reason: "counter file missing".to_string(),
                    })
                }
            }
            Err(source) => Err(UsageError::Io { path, source }),
        }
    }

    async fn ensure_dir(&self, workload_id: &str, dir: &Path) -> Result<(), UsageError> {
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(UsageError::NotFound {
                workload_id: workload_id.to_string(),
                path: dir.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(UsageError::NotFound {
                workload_id: workload_id.to_string(),
                path: dir.to_path_buf(),
            }),
            Err(source) => Err(UsageError::Io {
                path: dir.to_path_buf(),
                source,
            }),
        }
    }

    async fn read_counter(
        &self,
        workload_id: &str,
        dir: &Path,
        name: &str,
    ) -> Result<u64, UsageError> {
        let content = self.read_file(workload_id, dir, name).await?;
        Self::parse_counter(&content).map_err(|reason| UsageError::Parse {
            path: dir.join(name),
            reason,
        })
    }
}

#[async_trait]
impl UsageSource for CgroupUsageReader {
    async fn read_cpu_usage(&self, workload_id: &str) -> Result<CpuUsageSample, UsageError> {
        let dir = self.cpuacct_root.join(workload_id);
        self.ensure_dir(workload_id, &dir).await?;

        let stat = self.read_file(workload_id, &dir, CPUACCT_STAT).await?;
        let (user_mode_ns, system_mode_ns) = Self::parse_cpuacct_stat(&stat, self.clock_ticks)
            .map_err(|reason| UsageError::Parse {
                path: dir.join(CPUACCT_STAT),
                reason,
            })?;

        let total_usage_ns = self.read_counter(workload_id, &dir, CPUACCT_USAGE).await?;

        let percpu = self.read_file(workload_id, &dir, CPUACCT_USAGE_PERCPU).await?;
        let per_cpu_usage_ns = Self::parse_percpu(&percpu).map_err(|reason| UsageError::Parse {
            path: dir.join(CPUACCT_USAGE_PERCPU),
            reason,
        })?;

        Ok(CpuUsageSample {
            workload_id: workload_id.to_string(),
            total_usage_ns,
            user_mode_ns,
            system_mode_ns,
            per_cpu_usage_ns,
            created_at: chrono::Utc::now(),
        })
    }

    async fn read_memory_usage(&self, workload_id: &str) -> Result<MemoryUsageSample, UsageError> {
        let dir = self.memory_root.join(workload_id);
        self.ensure_dir(workload_id, &dir).await?;

        let usage_bytes = self.read_counter(workload_id, &dir, MEMORY_USAGE).await?;
        let max_usage_bytes = self.read_counter(workload_id, &dir, MEMORY_MAX_USAGE).await?;
        let limit_bytes = self.read_counter(workload_id, &dir, MEMORY_LIMIT).await?;

        Ok(MemoryUsageSample {
            workload_id: workload_id.to_string(),
            usage_bytes,
            max_usage_bytes,
            limit_bytes,
            created_at: chrono::Utc::now(),
        })
    }
}

fn parse_u64(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|e| format!("invalid counter {:?}: {}", value, e))
}

/// Instantaneous CPU utilisation between two total-usage observations
///
/// Returns `None` when the sample carries no per-CPU counters or the
/// cumulative total went backwards (the cgroup was recreated).
pub fn cpu_percent(previous_total_ns: u64, current: &CpuUsageSample) -> Option<f64> {
    let cores = current.per_cpu_usage_ns.len();
    if cores == 0 {
        return None;
    }
    let delta_ns = current.total_usage_ns.checked_sub(previous_total_ns)?;
    let delta_secs = delta_ns as f64 / NANOS_PER_SECOND as f64;

    Some(delta_secs / cores as f64 * 100.0)
}
