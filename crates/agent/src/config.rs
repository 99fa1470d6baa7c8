//! Agent configuration

use agent_lib::collector::{DEFAULT_CPUACCT_ROOT, DEFAULT_MEMORY_ROOT};
use agent_lib::lifecycle::ReloadHook;
use agent_lib::sync::ClientConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("collector_addr {0:?} is not in host:port form")]
    InvalidCollectorAddr(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("reconnect.initial_backoff_ms exceeds reconnect.max_backoff_secs")]
    BackoffRange,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    /// Collector address as `host:port`
    pub collector_addr: String,

    /// JSON file listing every known workload and its placement
    pub registry_path: PathBuf,

    /// Overrides the system hostname for placement matching
    #[serde(default)]
    pub hostname: Option<String>,

    /// Collection interval in seconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    #[serde(default = "default_cpuacct_root")]
    pub cpuacct_root: PathBuf,

    #[serde(default = "default_memory_root")]
    pub memory_root: PathBuf,

    /// API server port for health/metrics; 0 disables the server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Drop the connection when one envelope write blocks this long
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_collection_interval() -> u64 {
    10
}

fn default_cpuacct_root() -> PathBuf {
    PathBuf::from(DEFAULT_CPUACCT_ROOT)
}

fn default_memory_root() -> PathBuf {
    PathBuf::from(DEFAULT_MEMORY_ROOT)
}

fn default_api_port() -> u16 {
    8080
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    300
}

impl AgentConfig {
    /// Load configuration from an optional file overlaid with `AGENT_*` variables
    ///
    /// Nested keys use a double underscore, e.g. `AGENT_RECONNECT__ENABLED`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: AgentConfig = builder
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_addr.trim().is_empty() {
            return Err(ConfigError::Missing("collector_addr"));
        }
        if !is_host_port(&self.collector_addr) {
            return Err(ConfigError::InvalidCollectorAddr(
                self.collector_addr.clone(),
            ));
        }
        if self.registry_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("registry_path"));
        }
        if self.collection_interval_secs == 0 {
            return Err(ConfigError::Zero("collection_interval_secs"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Zero("connect_timeout_secs"));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::Zero("write_timeout_secs"));
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(ConfigError::Zero("reconnect.initial_backoff_ms"));
        }
        if Duration::from_millis(self.reconnect.initial_backoff_ms)
            > Duration::from_secs(self.reconnect.max_backoff_secs)
        {
            return Err(ConfigError::BackoffRange);
        }
        Ok(())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            collector_addr: self.collector_addr.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            reconnect: self.reconnect.enabled,
            initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.reconnect.max_backoff_secs),
            ..Default::default()
        }
    }

    /// Keys whose value differs from `other`
    ///
    /// Every key is read once at startup, so any difference needs a restart.
    pub fn changed_keys(&self, other: &AgentConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.collector_addr != other.collector_addr {
            changed.push("collector_addr");
        }
        if self.registry_path != other.registry_path {
            changed.push("registry_path");
        }
        if self.hostname != other.hostname {
            changed.push("hostname");
        }
        if self.collection_interval_secs != other.collection_interval_secs {
            changed.push("collection_interval_secs");
        }
        if self.cpuacct_root != other.cpuacct_root {
            changed.push("cpuacct_root");
        }
        if self.memory_root != other.memory_root {
            changed.push("memory_root");
        }
        if self.api_port != other.api_port {
            changed.push("api_port");
        }
        if self.connect_timeout_secs != other.connect_timeout_secs {
            changed.push("connect_timeout_secs");
        }
        if self.write_timeout_secs != other.write_timeout_secs {
            changed.push("write_timeout_secs");
        }
        if self.reconnect != other.reconnect {
            changed.push("reconnect");
        }
        changed
    }
}

/// Accept `ip:port` and `name:port`; name resolution happens on connect
fn is_host_port(addr: &str) -> bool {
    if addr.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}

/// Reload hook that re-reads and validates the configuration source
///
/// Nothing is applied live; differences from the running configuration
/// are logged as needing a restart.
pub fn reload_hook(path: Option<PathBuf>, running: AgentConfig) -> ReloadHook {
    Box::new(move || {
        let fresh = AgentConfig::load(path.as_deref())?;
        let changed = running.changed_keys(&fresh);
        if changed.is_empty() {
            info!("Configuration unchanged");
        } else {
            warn!(changed = ?changed, "Configuration changes take effect after restart");
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn minimal() -> AgentConfig {
        AgentConfig {
            collector_addr: "10.0.0.5:3001".to_string(),
            registry_path: PathBuf::from("/var/lib/agent/workloads.json"),
            hostname: None,
            collection_interval_secs: default_collection_interval(),
            cpuacct_root: default_cpuacct_root(),
            memory_root: default_memory_root(),
            api_port: default_api_port(),
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }

    #[test]
    fn test_load_applies_defaults() {
        let file = write_config(
            r#"
collector_addr = "10.0.0.5:3001"
registry_path = "/var/lib/agent/workloads.json"
"#,
        );

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config, minimal());
        assert_eq!(config.collection_interval(), Duration::from_secs(10));
        assert_eq!(config.cpuacct_root, PathBuf::from("/cgroup/cpuacct/openshift"));
    }

    #[test]
    fn test_load_nested_reconnect() {
        let file = write_config(
            r#"
collector_addr = "collector.internal:3001"
registry_path = "/tmp/workloads.json"
collection_interval_secs = 30
api_port = 0

[reconnect]
enabled = false
initial_backoff_ms = 250
"#,
        );

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.collection_interval_secs, 30);
        assert_eq!(config.api_port, 0);

        let client = config.client_config();
        assert!(!client.reconnect);
        assert_eq!(client.initial_backoff, Duration::from_millis(250));
        assert_eq!(client.max_backoff, Duration::from_secs(300));
        assert_eq!(client.collector_addr, "collector.internal:3001");
        assert_eq!(client.write_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_required_key_fails() {
        let file = write_config(r#"registry_path = "/tmp/workloads.json""#);
        let result = AgentConfig::load(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_validate() {
        assert!(minimal().validate().is_ok());

        let mut config = minimal();
        config.collection_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("collection_interval_secs"))
        ));

        let mut config = minimal();
        config.collector_addr = "no-port".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCollectorAddr(_))
        ));

        let mut config = minimal();
        config.collector_addr = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));

        let mut config = minimal();
        config.write_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("write_timeout_secs"))
        ));

        let mut config = minimal();
        config.reconnect.initial_backoff_ms = 600_000;
        assert!(matches!(config.validate(), Err(ConfigError::BackoffRange)));
    }

    #[test]
    fn test_is_host_port() {
        assert!(is_host_port("10.128.2.47:3001"));
        assert!(is_host_port("[::1]:3001"));
        assert!(is_host_port("collector:3001"));
        assert!(!is_host_port("collector"));
        assert!(!is_host_port(":3001"));
        assert!(!is_host_port("collector:http"));
    }

    #[test]
    fn test_changed_keys() {
        let running = minimal();
        assert!(running.changed_keys(&minimal()).is_empty());

        let mut fresh = minimal();
        fresh.collection_interval_secs = 60;
        fresh.reconnect.enabled = false;
        assert_eq!(
            running.changed_keys(&fresh),
            vec!["collection_interval_secs", "reconnect"]
        );
    }

    #[test]
    fn test_reload_hook() {
        let file = write_config(
            r#"
collector_addr = "10.0.0.5:3001"
registry_path = "/var/lib/agent/workloads.json"
"#,
        );
        let mut hook = reload_hook(Some(file.path().to_path_buf()), minimal());
        assert!(hook().is_ok());

        let broken = write_config(r#"collector_addr = "10.0.0.5:3001""#);
        let mut hook = reload_hook(Some(broken.path().to_path_buf()), minimal());
        assert!(hook().is_err());
    }
}
