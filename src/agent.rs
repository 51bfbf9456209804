//! Agent RPC boundary.
//!
//! Enforcement nodes run a separate agent that owns lease serving. The engine
//! reaches it through [`AgentClient`]: typed commands carrying the affected
//! [`Entity`], and lease-count queries used before deletions.
//!
//! [`TcpAgentClient`] speaks newline-delimited JSON over TCP. Each call opens
//! a connection, writes one [`AgentRequest`] line and reads one
//! [`AgentResponse`] line.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::model::{AddressEntity, Entity, EntityKind};
use crate::propagation::Operation;
use crate::range::{AddressRange, Family};

/// Configuration change sent to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentCommand {
    Create { entity: Entity },
    /// Carries both versions so the node can diff internally.
    Update { old: Entity, new: Entity },
    Delete { entity: Entity },
}

impl AgentCommand {
    pub fn operation(&self) -> Operation {
        match self {
            AgentCommand::Create { .. } => Operation::Create,
            AgentCommand::Update { .. } => Operation::Update,
            AgentCommand::Delete { .. } => Operation::Delete,
        }
    }

    /// The entity as it stands after the command.
    pub fn entity(&self) -> &Entity {
        match self {
            AgentCommand::Create { entity } | AgentCommand::Delete { entity } => entity,
            AgentCommand::Update { new, .. } => new,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.entity().kind()
    }

    /// Command that undoes this one on a node that already applied it.
    /// Deletes have none.
    pub fn compensation(&self) -> Option<AgentCommand> {
        match self {
            AgentCommand::Create { entity } => Some(AgentCommand::Delete {
                entity: entity.clone(),
            }),
            AgentCommand::Update { old, new } => Some(AgentCommand::Update {
                old: new.clone(),
                new: old.clone(),
            }),
            AgentCommand::Delete { .. } => None,
        }
    }
}

/// Asks a node how many live leases fall inside an entity's ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseQuery {
    pub kind: EntityKind,
    pub id: Uuid,
    pub family: Family,
    pub ranges: Vec<AddressRange>,
}

impl LeaseQuery {
    pub fn for_entity(entity: &impl AddressEntity) -> Self {
        Self {
            kind: entity.kind(),
            id: entity.id(),
            family: entity.family(),
            ranges: entity.ranges(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: String,
    pub reason: String,
}

/// Result of sending one command to several nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiNodeOutcome {
    /// Nodes that applied the command, in dispatch order.
    pub succeeded: Vec<String>,
    pub failed: Vec<NodeFailure>,
    /// Nodes never contacted because dispatch halted.
    pub skipped: Vec<String>,
}

impl MultiNodeOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn first_failure(&self) -> Option<&NodeFailure> {
        self.failed.first()
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        self.failed.iter().map(|failure| failure.node.clone()).collect()
    }
}

/// How [`AgentClient::send_to_nodes`] reacts to a failing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Stop at the first failure so the set to compensate is well defined.
    HaltOnFailure,
    /// Contact every node regardless of failures.
    All,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn send(&self, node: &str, command: &AgentCommand) -> Result<()>;

    async fn lease_count(&self, node: &str, query: &LeaseQuery) -> Result<u64>;

    /// Sends `command` to each node in turn.
    async fn send_to_nodes(
        &self,
        nodes: &[String],
        command: &AgentCommand,
        dispatch: Dispatch,
    ) -> MultiNodeOutcome {
        let mut outcome = MultiNodeOutcome::default();
        for (index, node) in nodes.iter().enumerate() {
            match self.send(node, command).await {
                Ok(()) => {
                    debug!("{} {} applied on {}", command.operation(), command.kind(), node);
                    outcome.succeeded.push(node.clone());
                }
                Err(error) => {
                    warn!(
                        "{} {} failed on {}: {}",
                        command.operation(),
                        command.kind(),
                        node,
                        error
                    );
                    outcome.failed.push(NodeFailure {
                        node: node.clone(),
                        reason: error.to_string(),
                    });
                    if dispatch == Dispatch::HaltOnFailure {
                        outcome.skipped = nodes[index + 1..].to_vec();
                        break;
                    }
                }
            }
        }
        outcome
    }
}

/// Wire request of the TCP agent protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Command { command: AgentCommand },
    LeaseCount { query: LeaseQuery },
}

/// Wire response of the TCP agent protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leases: Option<u64>,
}

/// JSON-lines agent client.
#[derive(Debug, Clone)]
pub struct TcpAgentClient {
    port: u16,
    timeout: Duration,
}

impl TcpAgentClient {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Node identifiers are either `ip`, `ip:port` or a host name; bare
    /// addresses use the configured port.
    fn endpoint(&self, node: &str) -> String {
        if let Ok(addr) = node.parse::<SocketAddr>() {
            addr.to_string()
        } else if let Ok(ip) = node.parse::<IpAddr>() {
            SocketAddr::new(ip, self.port).to_string()
        } else {
            format!("{}:{}", node, self.port)
        }
    }

    async fn call(&self, node: &str, request: &AgentRequest) -> Result<AgentResponse> {
        let endpoint = self.endpoint(node);
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let exchange = async {
            let mut stream = TcpStream::connect(&endpoint).await?;
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;

            let mut reader = BufReader::new(stream);
            let mut reply = String::new();
            if reader.read_line(&mut reply).await? == 0 {
                return Err(Error::Infrastructure(format!(
                    "agent {} closed the connection without replying",
                    endpoint
                )));
            }
            let response: AgentResponse = serde_json::from_str(reply.trim_end())?;
            Ok::<_, Error>(response)
        };

        timeout(self.timeout, exchange).await.map_err(|_| {
            Error::Infrastructure(format!(
                "agent {} did not answer within {:?}",
                endpoint, self.timeout
            ))
        })?
    }

    fn rejected(node: &str, response: &AgentResponse) -> Error {
        Error::Infrastructure(format!(
            "agent {} rejected the request: {}",
            node,
            response.error.as_deref().unwrap_or("no reason given")
        ))
    }
}

#[async_trait]
impl AgentClient for TcpAgentClient {
    async fn send(&self, node: &str, command: &AgentCommand) -> Result<()> {
        let request = AgentRequest::Command {
            command: command.clone(),
        };
        let response = self.call(node, &request).await?;
        if !response.ok {
            return Err(Self::rejected(node, &response));
        }
        Ok(())
    }

    async fn lease_count(&self, node: &str, query: &LeaseQuery) -> Result<u64> {
        let request = AgentRequest::LeaseCount {
            query: query.clone(),
        };
        let response = self.call(node, &request).await?;
        if !response.ok {
            return Err(Self::rejected(node, &response));
        }
        response.leases.ok_or_else(|| {
            Error::Infrastructure(format!("agent {} returned no lease count", node))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Lifetimes, Pool, Subnet};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    fn pool() -> Entity {
        let subnet = Subnet::new("10.0.0.0/24".parse().unwrap(), Lifetimes::default()).unwrap();
        Entity::from(
            Pool::new(
                subnet.id,
                "10.0.0.10".parse().unwrap(),
                "10.0.0.20".parse().unwrap(),
            )
            .unwrap(),
        )
    }

    struct FlakyAgent {
        failing: Vec<String>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentClient for FlakyAgent {
        async fn send(&self, node: &str, _command: &AgentCommand) -> Result<()> {
            self.sent.lock().await.push(node.to_string());
            if self.failing.iter().any(|failing| failing == node) {
                return Err(Error::Infrastructure("refused".to_string()));
            }
            Ok(())
        }

        async fn lease_count(&self, _node: &str, _query: &LeaseQuery) -> Result<u64> {
            Ok(0)
        }
    }

    fn nodes() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    #[test]
    fn test_compensation_reverses_commands() {
        let entity = pool();
        let create = AgentCommand::Create { entity: entity.clone() };
        assert_eq!(
            create.compensation(),
            Some(AgentCommand::Delete { entity: entity.clone() })
        );

        let mut changed = entity.clone();
        if let Entity::Pool(pool) = &mut changed {
            pool.comment = "lab".to_string();
        }
        let update = AgentCommand::Update {
            old: entity.clone(),
            new: changed.clone(),
        };
        assert_eq!(
            update.compensation(),
            Some(AgentCommand::Update { old: changed, new: entity.clone() })
        );
        assert_eq!(AgentCommand::Delete { entity }.compensation(), None);
    }

    #[tokio::test]
    async fn test_halt_on_failure_skips_remaining_nodes() {
        let agent = FlakyAgent {
            failing: vec!["B".to_string()],
            sent: Mutex::new(Vec::new()),
        };
        let command = AgentCommand::Create { entity: pool() };
        let outcome = agent.send_to_nodes(&nodes(), &command, Dispatch::HaltOnFailure).await;

        assert_eq!(outcome.succeeded, vec!["A".to_string()]);
        assert_eq!(outcome.first_failure().map(|f| f.node.as_str()), Some("B"));
        assert_eq!(outcome.skipped, vec!["C".to_string()]);
        assert_eq!(*agent.sent.lock().await, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_all_contacts_every_node() {
        let agent = FlakyAgent {
            failing: vec!["B".to_string()],
            sent: Mutex::new(Vec::new()),
        };
        let command = AgentCommand::Delete { entity: pool() };
        let outcome = agent.send_to_nodes(&nodes(), &command, Dispatch::All).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.succeeded, vec!["A".to_string(), "C".to_string()]);
        assert!(outcome.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_client_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();

                let request: AgentRequest = serde_json::from_str(line.trim_end()).unwrap();
                let response = match request {
                    AgentRequest::Command { .. } => AgentResponse {
                        ok: true,
                        ..Default::default()
                    },
                    AgentRequest::LeaseCount { .. } => AgentResponse {
                        ok: true,
                        leases: Some(3),
                        ..Default::default()
                    },
                };
                let mut reply = serde_json::to_string(&response).unwrap();
                reply.push('\n');
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let client = TcpAgentClient::new(&AgentConfig {
            port: 1,
            timeout_ms: 2000,
        });
        let node = addr.to_string();
        let entity = pool();

        client
            .send(&node, &AgentCommand::Create { entity: entity.clone() })
            .await
            .unwrap();
        let leases = client
            .lease_count(&node, &LeaseQuery::for_entity(&entity))
            .await
            .unwrap();
        assert_eq!(leases, 3);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_client_surfaces_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4096];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer).await;
            stream
                .write_all(b"{\"ok\":false,\"error\":\"subnet unknown\"}\n")
                .await
                .unwrap();
        });

        let client = TcpAgentClient::new(&AgentConfig {
            port: 1,
            timeout_ms: 2000,
        });
        let error = client
            .send(&addr.to_string(), &AgentCommand::Create { entity: pool() })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("subnet unknown"));
    }

    #[test]
    fn test_endpoint_uses_configured_port_for_bare_addresses() {
        let client = TcpAgentClient::new(&AgentConfig {
            port: 8067,
            timeout_ms: 100,
        });
        assert_eq!(client.endpoint("10.1.0.1"), "10.1.0.1:8067");
        assert_eq!(client.endpoint("fd00::1"), "[fd00::1]:8067");
        assert_eq!(client.endpoint("10.1.0.1:9000"), "10.1.0.1:9000");
        assert_eq!(client.endpoint("agent-1"), "agent-1:8067");
    }
}
