//! Resolves the set of nodes that must receive a subnet's configuration.
//!
//! Admin-pinned sentries are addressed directly. Every healthy server that is
//! not also a sentry mirrors the configuration, so it is added implicitly.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::error::{Error, Result};
use crate::range::Family;
use crate::registry::{HealthStatus, ServiceInstance, ServiceRegistry};

pub fn sentry_tag(family: Family) -> String {
    format!("sentry{}", family.suffix())
}

pub fn server_tag(family: Family) -> String {
    format!("server{}", family.suffix())
}

pub struct NodeResolver<'a> {
    registry: &'a dyn ServiceRegistry,
    service: &'a str,
}

impl<'a> NodeResolver<'a> {
    pub fn new(registry: &'a dyn ServiceRegistry, service: &'a str) -> Self {
        Self { registry, service }
    }

    /// Healthy instances of the service, in registry order.
    async fn healthy_instances(&self) -> Result<Vec<ServiceInstance>> {
        let passing: HashSet<String> = self
            .registry
            .health_checks(self.service)
            .await?
            .into_iter()
            .filter(|check| check.status == HealthStatus::Passing)
            .map(|check| check.service_id)
            .collect();

        Ok(self
            .registry
            .instances(self.service)
            .await?
            .into_iter()
            .filter(|instance| passing.contains(&instance.id))
            .collect())
    }

    /// Returns the sorted, deduplicated node addresses for a subnet of
    /// `family` with the given pinned sentries.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if a pinned node is unhealthy, unknown or not
    ///   tagged as a sentry for the family
    /// - [`Error::Infrastructure`] if no healthy server exists for the family
    pub async fn resolve(&self, family: Family, pinned: &[String]) -> Result<Vec<String>> {
        let healthy = self.healthy_instances().await?;
        let sentry = sentry_tag(family);
        let server = server_tag(family);

        let mut nodes = BTreeSet::new();
        for node in pinned {
            let instance = healthy
                .iter()
                .find(|instance| &instance.address == node)
                .ok_or_else(|| {
                    Error::validation(format!(
                        "sentry node {} is not healthy or not registered",
                        node
                    ))
                })?;
            if !instance.has_tag(&sentry) {
                return Err(Error::validation(format!(
                    "node {} is not tagged {}",
                    node, sentry
                )));
            }
            nodes.insert(instance.address.clone());
        }

        let servers: Vec<&ServiceInstance> = healthy
            .iter()
            .filter(|instance| instance.has_tag(&server))
            .collect();
        if servers.is_empty() {
            return Err(Error::Infrastructure(format!(
                "no healthy {} node registered under {}",
                server, self.service
            )));
        }

        nodes.extend(
            servers
                .into_iter()
                .filter(|instance| !instance.has_tag(&sentry))
                .map(|instance| instance.address.clone()),
        );

        let nodes: Vec<String> = nodes.into_iter().collect();
        debug!("Resolved {} nodes: {:?}", family, nodes);
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{StaticInstance, StaticRegistry};

    fn registry() -> StaticRegistry {
        StaticRegistry::new(
            "dhcp",
            vec![
                StaticInstance::new("a", "A", &["sentry4"]),
                StaticInstance::new("b", "B", &["server4"]),
                StaticInstance::new("c", "C", &["sentry4", "server4"]),
            ],
        )
    }

    fn pinned(nodes: &[&str]) -> Vec<String> {
        nodes.iter().map(|node| node.to_string()).collect()
    }

    #[tokio::test]
    async fn test_pinned_sentry_plus_server_only_nodes() {
        let registry = registry();
        let resolver = NodeResolver::new(&registry, "dhcp");
        let nodes = resolver.resolve(Family::V4, &pinned(&["A"])).await.unwrap();
        assert_eq!(nodes, pinned(&["A", "B"]));
    }

    #[tokio::test]
    async fn test_no_pinned_sentries_resolves_to_servers() {
        let registry = registry();
        let resolver = NodeResolver::new(&registry, "dhcp");
        let nodes = resolver.resolve(Family::V4, &[]).await.unwrap();
        assert_eq!(nodes, pinned(&["B"]));
    }

    #[tokio::test]
    async fn test_pinned_node_must_be_sentry() {
        let registry = registry();
        let resolver = NodeResolver::new(&registry, "dhcp");
        assert!(matches!(
            resolver.resolve(Family::V4, &pinned(&["B"])).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unhealthy_nodes_are_excluded() {
        let registry = registry();
        registry.set_status("a", HealthStatus::Warning).await.unwrap();
        let resolver = NodeResolver::new(&registry, "dhcp");
        assert!(matches!(
            resolver.resolve(Family::V4, &pinned(&["A"])).await,
            Err(Error::Validation(_))
        ));

        registry.set_status("b", HealthStatus::Critical).await.unwrap();
        let nodes = resolver.resolve(Family::V4, &[]).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_no_healthy_server_is_infrastructure_error() {
        let registry = registry();
        let resolver = NodeResolver::new(&registry, "dhcp");
        assert!(matches!(
            resolver.resolve(Family::V6, &[]).await,
            Err(Error::Infrastructure(_))
        ));
    }
}
