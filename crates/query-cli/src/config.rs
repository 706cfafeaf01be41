use anyhow::{Context, Result};
use query_distributed::{ClusterConfig, NetworkConfig, QueryId, RuntimeConfig, WorkerInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cluster description shared by every `qe-cluster` subcommand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Static worker registry used by the coordinator
    pub workers: Vec<WorkerInfo>,
    /// Runtime settings sent with every job of `qe-cluster run`
    pub runtime: RuntimeConfig,
    pub cluster: ClusterConfig,
    pub network: NetworkConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Runtime settings for a new query, under a fresh query id
    pub fn query_runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            query_id: QueryId::new(),
            ..self.runtime.clone()
        }
    }

    /// Find a worker entry by name
    pub fn worker(&self, name: &str) -> Option<&WorkerInfo> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"workers": [{"name": "w0", "host": "127.0.0.1", "control_port": 7000, "data_port": 7001}]}"#,
        )
        .unwrap();
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.worker("w0").unwrap().control_port, 7000);
        assert_eq!(config.cluster.default_parallelism, 4);
        assert!(config.runtime.coordinator.is_none());
    }

    #[test]
    fn test_query_runtime_keeps_settings_with_fresh_id() {
        let config: Config = serde_json::from_str(
            r#"{"runtime": {"flush_threshold": 16, "coordinator": "127.0.0.1:7070"}}"#,
        )
        .unwrap();
        let first = config.query_runtime();
        let second = config.query_runtime();
        assert_eq!(first.flush_threshold, 16);
        assert_eq!(first.coordinator.as_deref(), Some("127.0.0.1:7070"));
        assert_ne!(first.query_id, second.query_id);
        assert_ne!(first.query_id, config.runtime.query_id);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("qe-cluster-{}.json", std::process::id()));
        let mut config = Config::default();
        config.workers.push(WorkerInfo::new("w1", "localhost", 7100, 7101));
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.workers[0].name, "w1");
        std::fs::remove_file(&path).unwrap();
    }
}
