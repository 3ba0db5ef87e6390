use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use workflows_core::EngineConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of logarithm tasks to run
    #[serde(default = "default_demo_tasks")]
    pub tasks: u32,
}

fn default_demo_tasks() -> u32 {
    100
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tasks: default_demo_tasks(),
        }
    }
}

impl CliConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Ok(Self::default())
        }
    }
}
