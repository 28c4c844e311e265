use crate::runners;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use stepgraph_core::storage::RedbGraphStore;
use stepgraph_core::{EngineConfig, ProjectController, StepAction};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub runners: RunnersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "stepgraph.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}

/// Which runner executes which steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnersConfig {
    /// Latency of the built-in simulated runner, used for actions without a webhook
    #[serde(default = "default_simulated_latency_ms")]
    pub simulated_latency_ms: u64,

    /// Webhook URL per action
    #[serde(default)]
    pub webhooks: HashMap<StepAction, String>,

    /// Webhook URL per agent name; takes precedence over the action
    #[serde(default)]
    pub agents: HashMap<String, String>,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

fn default_simulated_latency_ms() -> u64 {
    50
}

fn default_webhook_timeout_secs() -> u64 {
    300
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            simulated_latency_ms: default_simulated_latency_ms(),
            webhooks: HashMap::new(),
            agents: HashMap::new(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the database file path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.database_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ProjectController>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbGraphStore::new(config.database_path()).context("Failed to create graph store")?,
        );

        let registry = runners::build_registry(&config.runners).context("Failed to set up step runners")?;

        let controller = Arc::new(ProjectController::new(store, registry, config.engine.clone()));

        Ok(Self { controller })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml"), dir.path().join("data")).unwrap();

        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.retry.max_delay_ms, 30_000);
        assert_eq!(config.runners.simulated_latency_ms, 50);
        assert!(!config.logging.json);
        assert_eq!(config.database_path(), dir.path().join("data").join("stepgraph.redb"));
        assert!(dir.path().join("data").exists());
    }

    #[test]
    fn test_parse_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stepgraph.toml");
        std::fs::write(
            &path,
            r#"
[storage]
database_file = "graphs.redb"

[engine]
max_concurrency = 8
poll_interval_ms = 100

[engine.retry]
base_delay_ms = 500
default_max_retries = 5

[runners]
simulated_latency_ms = 0

[runners.webhooks]
deploy = "http://localhost:9000/deploy"

[runners.agents]
coder = "http://localhost:9000/coder"

[logging]
json = true
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.storage.database_file, "graphs.redb");
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.step_timeout_secs, 600);
        assert_eq!(config.engine.retry.base_delay_ms, 500);
        assert_eq!(config.engine.retry.max_delay_ms, 30_000);
        assert_eq!(config.engine.retry.default_max_retries, 5);
        assert_eq!(
            config.runners.webhooks.get(&StepAction::Deploy).map(String::as_str),
            Some("http://localhost:9000/deploy")
        );
        assert!(config.runners.agents.contains_key("coder"));
        assert!(config.logging.json);
    }
}
