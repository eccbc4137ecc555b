use anyhow::{Context, Result};
use runloom_core::connector::{register_builtin_connectors, ConnectorRegistry};
use runloom_core::queue::MemoryJobQueue;
use runloom_core::storage::RedbRunStore;
use runloom_core::workflow::Engine;
use runloom_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "runloom.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the redb database path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.database_file)
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub engine: Engine,
    pub queue: Arc<MemoryJobQueue>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbRunStore::new(config.database_path()).context("Failed to create run store")?,
        );

        let mut registry = ConnectorRegistry::new();
        register_builtin_connectors(&mut registry).context("Failed to register connectors")?;

        let queue = Arc::new(MemoryJobQueue::new());
        let engine = Engine::new(store, Arc::new(registry), queue.clone(), config.engine.clone());

        Ok(Self { engine, queue })
    }
}
