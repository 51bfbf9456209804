//! # dhcpscope
//!
//! Address-space allocation and propagation engine for DHCP deployments.
//!
//! ## Features
//!
//! - Subnets, pools, reserved pools, reservations and IPv6 prefix-delegation pools
//! - Conflict detection with carve-out absorption (reservations inside pools are legal)
//! - Zero-sum capacity accounting in 128-bit saturating arithmetic
//! - Node resolution from a service registry (pinned sentries plus mirroring servers)
//! - Sequential multi-node propagation with compensating rollback and a persisted saga log
//! - Pool templates with dry-run validation
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dhcpscope::{AllocationEngine, Config, MemoryStore, StaticRegistry, TcpAgentClient};
//!
//! #[tokio::main]
//! async fn main() -> dhcpscope::Result<()> {
//!     let config = Config::load_or_create("config.json").await?;
//!     let store = MemoryStore::open(&config.store_file).await?;
//!     let agent = TcpAgentClient::new(&config.agent);
//!     let registry = StaticRegistry::new(
//!         config.registry.service.clone(),
//!         config.registry.instances.clone(),
//!     );
//!
//!     let engine =
//!         AllocationEngine::new(config, Arc::new(store), Arc::new(agent), Arc::new(registry));
//!     for subnet in engine.list_subnets().await? {
//!         println!("{} capacity {}", subnet.prefix, subnet.capacity);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`range`] - Address arithmetic and [`Capacity`]
//! - [`model`] - Entity kinds and the [`Entity`] union
//! - [`conflict`] - Containment and sibling conflict checks
//! - [`ledger`] - Capacity accounting between subnets and pools
//! - [`resolver`] - Dispatch node set from the [`ServiceRegistry`]
//! - [`propagation`] - Multi-node dispatch, rollback and saga records
//! - [`store`] - Transactional storage boundary and [`MemoryStore`]
//! - [`agent`] - Agent RPC boundary and [`TcpAgentClient`]
//! - [`AllocationEngine`] - Orchestrates every mutation

pub mod agent;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod model;
pub mod propagation;
pub mod range;
pub mod registry;
pub mod resolver;
pub mod store;

pub use agent::{AgentClient, AgentCommand, LeaseQuery, MultiNodeOutcome, TcpAgentClient};
pub use config::Config;
pub use engine::AllocationEngine;
pub use error::{Error, Result};
pub use model::{
    AddressEntity, ClientId, Entity, EntityKind, Lifetimes, PdPool, Pool, PoolTemplate,
    Reservation, ReservedPdPool, ReservedPool, Subnet, SubnetChildren,
};
pub use propagation::{Operation, PropagationRecord, PropagationState, RollbackPolicy};
pub use range::{AddressRange, Capacity, Family};
pub use registry::{HealthCheck, HealthStatus, ServiceInstance, ServiceRegistry, StaticRegistry};
pub use store::{MemoryStore, Store, Transaction};
