//! Service registry boundary.
//!
//! Enforcement nodes register under a service name with role tags
//! (`sentry4`, `server6`, ...) and a health check. Only instances whose
//! check is [`HealthStatus::Passing`] receive configuration.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Passing => write!(f, "passing"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub service_id: String,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    /// Address the agent listens on; used as the node identifier.
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceInstance {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Health-check records of every instance registered under `service`.
    async fn health_checks(&self, service: &str) -> Result<Vec<HealthCheck>>;

    async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>>;
}

/// Registry entry declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticInstance {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: HealthStatus,
}

impl StaticInstance {
    pub fn new(id: &str, address: &str, tags: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            status: HealthStatus::Passing,
        }
    }
}

/// Fixed registry for deployments without a discovery service.
///
/// Statuses can be changed at runtime with [`set_status`](Self::set_status).
#[derive(Debug)]
pub struct StaticRegistry {
    service: String,
    instances: RwLock<Vec<StaticInstance>>,
}

impl StaticRegistry {
    pub fn new(service: impl Into<String>, instances: Vec<StaticInstance>) -> Self {
        Self {
            service: service.into(),
            instances: RwLock::new(instances),
        }
    }

    pub async fn set_status(&self, id: &str, status: HealthStatus) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .iter_mut()
            .find(|instance| instance.id == id)
            .ok_or_else(|| Error::Infrastructure(format!("unknown service instance {}", id)))?;
        instance.status = status;
        Ok(())
    }

    fn check_service(&self, service: &str) -> Result<()> {
        if service != self.service {
            return Err(Error::Infrastructure(format!(
                "service {} is not registered (static registry serves {})",
                service, self.service
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn health_checks(&self, service: &str) -> Result<Vec<HealthCheck>> {
        self.check_service(service)?;
        Ok(self
            .instances
            .read()
            .await
            .iter()
            .map(|instance| HealthCheck {
                service_id: instance.id.clone(),
                status: instance.status,
            })
            .collect())
    }

    async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        self.check_service(service)?;
        Ok(self
            .instances
            .read()
            .await
            .iter()
            .map(|instance| ServiceInstance {
                id: instance.id.clone(),
                address: instance.address.clone(),
                tags: instance.tags.clone(),
            })
            .collect())
    }
}
