//! Multi-node propagation with compensating rollback.
//!
//! Commands are dispatched to the resolved nodes one at a time so that the
//! set of nodes needing compensation is known exactly when node k fails.
//!
//! - Create and update halt at the first failing node k. If k is the first
//!   node the outcome is `PropagationFailed` and the storage write is
//!   dropped. Otherwise nodes 1..k−1 are compensated (or not, per policy) and
//!   the outcome is `PartiallyPropagated`.
//! - Delete is sent to every node even after a failure. If no node applied
//!   it the outcome is `PropagationFailed`; if some did, it is
//!   `PartiallyPropagated` and the failed nodes still carry the entity.
//!
//! A `PartiallyPropagated` mutation leaves a [`PropagationRecord`] in the
//! same transaction as the storage write so a reconciler can find it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentCommand, Dispatch, MultiNodeOutcome};
use crate::error::Error;
use crate::model::{AddressEntity, Entity, EntityKind};
use crate::range::Family;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// What happens to nodes that already applied a command when a later node
/// fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Send the compensating command to every node that succeeded.
    Compensate,
    /// Leave them configured and surface the error.
    SurfaceOnly,
}

impl RollbackPolicy {
    /// v4 pools and v4 reservations are lightweight and are not compensated
    /// unless `compensate_lightweight` is set.
    pub fn for_entity(entity: &Entity, compensate_lightweight: bool) -> Self {
        let lightweight = entity.family() == Family::V4
            && matches!(entity.kind(), EntityKind::Pool | EntityKind::Reservation);
        if lightweight && !compensate_lightweight {
            RollbackPolicy::SurfaceOnly
        } else {
            RollbackPolicy::Compensate
        }
    }
}

/// Where a mutation ended up once propagation finished.
///
/// Validation and staging happen inside the open store transaction, so only
/// the terminal states are observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationState {
    Propagated,
    PartiallyPropagated,
    PropagationFailed,
}

impl fmt::Display for PropagationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropagationState::Propagated => "propagated",
            PropagationState::PartiallyPropagated => "partially propagated",
            PropagationState::PropagationFailed => "propagation failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Pending,
    Resolved,
}

/// Saga intent log entry for a partially propagated mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub operation: Operation,
    pub kind: EntityKind,
    pub entity_id: Uuid,
    pub family: Family,
    pub entity: Entity,
    /// Every node the command was meant for, in dispatch order.
    pub dispatched: Vec<String>,
    /// Nodes that applied the command.
    pub succeeded: Vec<String>,
    pub failed_node: String,
    pub error: String,
    /// Nodes that applied the compensating command.
    pub rolled_back: Vec<String>,
    /// Nodes still carrying the change: rollback failed or was not attempted.
    pub rollback_pending: Vec<String>,
    #[serde(default)]
    pub state: RecordState,
}

impl PropagationRecord {
    fn new(
        command: &AgentCommand,
        dispatched: &[String],
        succeeded: Vec<String>,
        failed_node: String,
        error: String,
        rolled_back: Vec<String>,
        rollback_pending: Vec<String>,
    ) -> Self {
        let entity = command.entity().clone();
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            operation: command.operation(),
            kind: entity.kind(),
            entity_id: entity.id(),
            family: entity.family(),
            entity,
            dispatched: dispatched.to_vec(),
            succeeded,
            failed_node,
            error,
            rolled_back,
            rollback_pending,
            state: RecordState::Pending,
        }
    }
}

/// Result of propagating one command.
#[derive(Debug)]
pub enum PropagationOutcome {
    /// Every node applied the command.
    Propagated { nodes: Vec<String> },
    /// Nothing to keep: the caller drops its transaction and returns `error`.
    Failed { error: Error },
    /// Some nodes applied the command: the caller commits with `record` and
    /// returns `error`.
    Partial {
        record: Box<PropagationRecord>,
        error: Error,
    },
}

impl PropagationOutcome {
    pub fn state(&self) -> PropagationState {
        match self {
            PropagationOutcome::Propagated { .. } => PropagationState::Propagated,
            PropagationOutcome::Failed { .. } => PropagationState::PropagationFailed,
            PropagationOutcome::Partial { .. } => PropagationState::PartiallyPropagated,
        }
    }
}

pub struct Propagator<'a> {
    agent: &'a dyn AgentClient,
}

impl<'a> Propagator<'a> {
    pub fn new(agent: &'a dyn AgentClient) -> Self {
        Self { agent }
    }

    pub async fn propagate(
        &self,
        nodes: &[String],
        command: &AgentCommand,
        policy: RollbackPolicy,
    ) -> PropagationOutcome {
        if nodes.is_empty() {
            warn!(
                "{} {} has no node to propagate to",
                command.operation(),
                command.kind()
            );
            return PropagationOutcome::Propagated { nodes: Vec::new() };
        }

        match command {
            AgentCommand::Delete { .. } => self.propagate_delete(nodes, command).await,
            _ => self.propagate_change(nodes, command, policy).await,
        }
    }

    async fn propagate_delete(
        &self,
        nodes: &[String],
        command: &AgentCommand,
    ) -> PropagationOutcome {
        let outcome = self.agent.send_to_nodes(nodes, command, Dispatch::All).await;
        if outcome.is_success() {
            info!("{} {} on {} node(s)", command.operation(), command.kind(), nodes.len());
            return PropagationOutcome::Propagated {
                nodes: outcome.succeeded,
            };
        }

        if outcome.succeeded.is_empty() {
            let error = Self::delete_error(command, &outcome);
            return PropagationOutcome::Failed { error };
        }

        warn!(
            "{} {} applied on {:?} while {:?} failed",
            command.operation(),
            command.kind(),
            outcome.succeeded,
            outcome.failed_nodes()
        );
        Self::partial_delete(nodes, command, &outcome)
    }

    /// Removes `entity` from nodes that no longer serve it. Storage already
    /// reflects the change, so any failure is [`PropagationOutcome::Partial`].
    pub async fn withdraw(&self, nodes: &[String], entity: &Entity) -> PropagationOutcome {
        let command = AgentCommand::Delete {
            entity: entity.clone(),
        };
        let outcome = self.agent.send_to_nodes(nodes, &command, Dispatch::All).await;
        if outcome.is_success() {
            info!("Withdrew {} from {:?}", entity.entity_ref(), nodes);
            return PropagationOutcome::Propagated {
                nodes: outcome.succeeded,
            };
        }
        Self::partial_delete(nodes, &command, &outcome)
    }

    /// Nodes that failed the delete still carry the entity.
    fn partial_delete(
        nodes: &[String],
        command: &AgentCommand,
        outcome: &MultiNodeOutcome,
    ) -> PropagationOutcome {
        let error = Self::delete_error(command, outcome);
        let pending = outcome.failed_nodes();
        let (failed_node, reason) = outcome
            .first_failure()
            .map(|failure| (failure.node.clone(), failure.reason.clone()))
            .unwrap_or_default();
        let record = PropagationRecord::new(
            command,
            nodes,
            outcome.succeeded.clone(),
            failed_node,
            reason,
            Vec::new(),
            pending,
        );
        PropagationOutcome::Partial {
            record: Box::new(record),
            error,
        }
    }

    fn delete_error(command: &AgentCommand, outcome: &MultiNodeOutcome) -> Error {
        let (node, reason) = outcome
            .first_failure()
            .map(|failure| (failure.node.clone(), failure.reason.clone()))
            .unwrap_or_default();
        Error::Propagation {
            operation: command.operation(),
            kind: command.kind(),
            node,
            reason,
            rolled_back: Vec::new(),
            rollback_failed: outcome.failed_nodes(),
        }
    }

    async fn propagate_change(
        &self,
        nodes: &[String],
        command: &AgentCommand,
        policy: RollbackPolicy,
    ) -> PropagationOutcome {
        let outcome = self
            .agent
            .send_to_nodes(nodes, command, Dispatch::HaltOnFailure)
            .await;
        let Some(failure) = outcome.first_failure().cloned() else {
            info!("{} {} on {} node(s)", command.operation(), command.kind(), nodes.len());
            return PropagationOutcome::Propagated {
                nodes: outcome.succeeded,
            };
        };

        if !outcome.skipped.is_empty() {
            debug!(
                "{} {} not sent to {:?} after {} failed",
                command.operation(),
                command.kind(),
                outcome.skipped,
                failure.node
            );
        }

        if outcome.succeeded.is_empty() {
            return PropagationOutcome::Failed {
                error: Error::Propagation {
                    operation: command.operation(),
                    kind: command.kind(),
                    node: failure.node,
                    reason: failure.reason,
                    rolled_back: Vec::new(),
                    rollback_failed: Vec::new(),
                },
            };
        }

        let (rolled_back, rollback_pending) = match (policy, command.compensation()) {
            (RollbackPolicy::Compensate, Some(compensation)) => {
                self.compensate(&outcome, &compensation).await
            }
            _ => {
                warn!(
                    "{} {} left applied on {:?} without rollback",
                    command.operation(),
                    command.kind(),
                    outcome.succeeded
                );
                (Vec::new(), outcome.succeeded.clone())
            }
        };

        let record = PropagationRecord::new(
            command,
            nodes,
            outcome.succeeded.clone(),
            failure.node.clone(),
            failure.reason.clone(),
            rolled_back.clone(),
            rollback_pending.clone(),
        );

        PropagationOutcome::Partial {
            record: Box::new(record),
            error: Error::Propagation {
                operation: command.operation(),
                kind: command.kind(),
                node: failure.node,
                reason: failure.reason,
                rolled_back,
                rollback_failed: rollback_pending,
            },
        }
    }

    /// Sends `compensation` to every node that applied the original command.
    /// Failures are logged and never retried.
    async fn compensate(
        &self,
        outcome: &MultiNodeOutcome,
        compensation: &AgentCommand,
    ) -> (Vec<String>, Vec<String>) {
        let mut rolled_back = Vec::new();
        let mut failed = Vec::new();
        for node in &outcome.succeeded {
            match self.agent.send(node, compensation).await {
                Ok(()) => rolled_back.push(node.clone()),
                Err(err) => {
                    error!(
                        "Rollback {} {} on {} failed, node is inconsistent with storage: {}",
                        compensation.operation(),
                        compensation.kind(),
                        node,
                        err
                    );
                    failed.push(node.clone());
                }
            }
        }
        (rolled_back, failed)
    }
}
