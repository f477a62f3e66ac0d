use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use carrier::{CarrierConfig, PacketLossSimulation};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub tick_ms: u64,
    pub carrier: CarrierConfig,
    pub simulation: PacketLossSimulation,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5,
            carrier: CarrierConfig::default(),
            simulation: PacketLossSimulation::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.carrier.validate()?;
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}
