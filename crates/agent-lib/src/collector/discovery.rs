//! Local workload discovery
//!
//! Queries the workload registry and keeps only the workloads that have a
//! placement record on this host.

use crate::health::{components, HealthRegistry};
use crate::models::Workload;
use crate::registry::WorkloadRegistry;
use std::io;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Resolves the name this host is known by in placement records
pub type HostnameResolver = Box<dyn Fn() -> io::Result<String> + Send + Sync>;

/// Hostname as reported by the operating system
pub fn system_hostname() -> io::Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hostname is not valid UTF-8"))
}

/// Filters registry workloads down to the ones placed on this host
pub struct WorkloadLocator {
    registry: Arc<dyn WorkloadRegistry>,
    resolver: HostnameResolver,
    /// Cached after the first successful resolution
    hostname: OnceLock<String>,
    health: Option<HealthRegistry>,
}

impl WorkloadLocator {
    /// Locator resolving the hostname from the operating system
    pub fn new(registry: Arc<dyn WorkloadRegistry>) -> Self {
        Self::with_resolver(registry, Box::new(system_hostname))
    }

    pub fn with_resolver(registry: Arc<dyn WorkloadRegistry>, resolver: HostnameResolver) -> Self {
        Self {
            registry,
            resolver,
            hostname: OnceLock::new(),
            health: None,
        }
    }

    /// Locator pinned to a configured hostname
    pub fn with_hostname(registry: Arc<dyn WorkloadRegistry>, hostname: impl Into<String>) -> Self {
        let locator = Self::new(registry);
        let _ = locator.hostname.set(hostname.into());
        locator
    }

    /// Report registry reachability to the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Local hostname, resolving it on first use
    pub fn hostname(&self) -> io::Result<&str> {
        if let Some(name) = self.hostname.get() {
            return Ok(name);
        }
        let resolved = (self.resolver)()?;
        Ok(self.hostname.get_or_init(|| resolved))
    }

    /// Workloads with a placement record on this host, in registry order
    ///
    /// Registry and hostname failures are logged and yield an empty set for
    /// this cycle.
    pub async fn local_workloads(&self) -> Vec<Workload> {
        self.try_local_workloads().await.unwrap_or_default()
    }

    /// Like [`local_workloads`](Self::local_workloads), but `None` when the
    /// registry or hostname could not be read this cycle
    ///
    /// An empty `Some` means nothing is placed here; `None` means placement
    /// is unknown.
    pub async fn try_local_workloads(&self) -> Option<Vec<Workload>> {
        let workloads = match self.registry.all_workloads().await {
            Ok(workloads) => {
                if let Some(health) = &self.health {
                    health.set_healthy(components::REGISTRY).await;
                }
                workloads
            }
            Err(e) => {
                warn!(error = %e, "Failed to query workload registry");
                if let Some(health) = &self.health {
                    health.set_degraded(components::REGISTRY, e.to_string()).await;
                }
                return None;
            }
        };

        let hostname = match self.hostname() {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Failed to resolve local hostname, skipping cycle");
                return None;
            }
        };

        let local: Vec<Workload> = workloads
            .into_iter()
            .filter(|w| w.is_placed_on(hostname))
            .collect();

        debug!(hostname = %hostname, count = local.len(), "Located local workloads");
        Some(local)
    }
}
