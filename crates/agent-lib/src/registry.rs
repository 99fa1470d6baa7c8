//! Workload registry access
//!
//! The registry is an external datastore shared by the whole platform. The
//! agent only reads it: every query returns the complete workload set and
//! host filtering happens locally.

use crate::models::Workload;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode registry at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of all workload records
#[async_trait]
pub trait WorkloadRegistry: Send + Sync {
    /// Fetch every workload, in the registry's own order
    async fn all_workloads(&self) -> Result<Vec<Workload>, RegistryError>;
}

/// Registry backed by a JSON document holding an array of workloads
///
/// The file is re-read on every query so that an external exporter can
/// rewrite it in place.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl WorkloadRegistry for FileRegistry {
    async fn all_workloads(&self) -> Result<Vec<Workload>, RegistryError> {
        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|source| RegistryError::Read {
                path: self.path.clone(),
                source,
            })?;

        serde_json::from_slice(&content).map_err(|source| RegistryError::Decode {
            path: self.path.clone(),
            source,
        })
    }
}

/// Fixed in-memory registry
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    workloads: Vec<Workload>,
}

impl StaticRegistry {
    pub fn new(workloads: Vec<Workload>) -> Self {
        Self { workloads }
    }
}

#[async_trait]
impl WorkloadRegistry for StaticRegistry {
    async fn all_workloads(&self) -> Result<Vec<Workload>, RegistryError> {
        Ok(self.workloads.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_registry_reads_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workloads.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "app1", "gears": [{"server_identity": "node-a"}]},
                {"id": "app2", "gears": []}
            ]"#,
        )
        .unwrap();

        let registry = FileRegistry::new(&path);
        let workloads = registry.all_workloads().await.unwrap();

        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].id, "app1");
        assert_eq!(workloads[0].gears[0].server_identity, "node-a");
    }

    #[tokio::test]
    async fn test_file_registry_missing_file() {
        let registry = FileRegistry::new("/nonexistent/workloads.json");
        let err = registry.all_workloads().await.unwrap_err();
        assert!(matches!(err, RegistryError::Read { .. }));
    }

    #[tokio::test]
    async fn test_file_registry_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workloads.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileRegistry::new(&path).all_workloads().await.unwrap_err();
        assert!(matches!(err, RegistryError::Decode { .. }));
    }
}
