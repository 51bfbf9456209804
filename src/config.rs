use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::Lifetimes;
use crate::range::Family;
use crate::registry::StaticInstance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store_file: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub defaults: SubnetDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Service name the enforcement nodes register under.
    pub service: String,
    #[serde(default)]
    pub instances: Vec<StaticInstance>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service: "dhcp-agent".to_string(),
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Port used for node identifiers without an explicit port.
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 8067,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Also roll back v4 pools and v4 reservations on partial failure.
    #[serde(default)]
    pub compensate_lightweight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetDefaults {
    pub lifetimes_v4: Lifetimes,
    pub lifetimes_v6: Lifetimes,
}

impl Default for SubnetDefaults {
    fn default() -> Self {
        Self {
            lifetimes_v4: Lifetimes::default(),
            lifetimes_v6: Lifetimes {
                preferred: Some(9000),
                ..Lifetimes::default()
            },
        }
    }
}

impl SubnetDefaults {
    pub fn lifetimes(&self, family: Family) -> Lifetimes {
        match family {
            Family::V4 => self.lifetimes_v4,
            Family::V6 => self.lifetimes_v6,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_file: "store.json".to_string(),
            registry: RegistryConfig::default(),
            agent: AgentConfig::default(),
            propagation: PropagationConfig::default(),
            defaults: SubnetDefaults::default(),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_file.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "store_file must not be empty".to_string(),
            ));
        }

        if self.registry.service.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "registry.service must not be empty".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for instance in &self.registry.instances {
            if instance.address.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "registry instance {} has no address",
                    instance.id
                )));
            }
            if !ids.insert(instance.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "registry instance {} is declared twice",
                    instance.id
                )));
            }
        }

        if self.agent.port == 0 {
            return Err(Error::InvalidConfig(
                "agent.port must be greater than 0".to_string(),
            ));
        }

        if self.agent.timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "agent.timeout_ms must be greater than 0".to_string(),
            ));
        }

        for family in [Family::V4, Family::V6] {
            self.defaults
                .lifetimes(family)
                .validate(family)
                .map_err(|error| {
                    Error::InvalidConfig(format!("default {} lifetimes: {}", family, error))
                })?;
        }

        Ok(())
    }
}
