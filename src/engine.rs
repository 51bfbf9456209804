//! The allocation engine.
//!
//! Every mutation follows the same sequence inside one store transaction:
//!
//! 1. load the parent subnet and its children
//! 2. validate the candidate (containment, conflicts, field rules)
//! 3. plan capacity changes with the [`CapacityLedger`] and stage all writes
//! 4. resolve the node set and propagate the command
//! 5. commit, drop, or commit with a saga record depending on the
//!    [`PropagationOutcome`]
//!
//! The engine holds no state besides its collaborators, so it can be shared
//! across tasks behind an [`Arc`].

use std::sync::Arc;

use ipnet::IpNet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentCommand, LeaseQuery};
use crate::config::Config;
use crate::conflict;
use crate::error::{Error, Result};
use crate::ledger::{self, CapacityLedger};
use crate::model::{
    AddressEntity, Entity, EntityKind, PdPool, Pool, PoolTemplate, Reservation, ReservedPdPool,
    ReservedPool, Subnet, SubnetChildren,
};
use crate::propagation::{
    PropagationOutcome, PropagationRecord, PropagationState, Propagator, RecordState,
    RollbackPolicy,
};
use crate::range::{self, AddressRange, Family};
use crate::registry::ServiceRegistry;
use crate::resolver::NodeResolver;
use crate::store::{Store, Transaction};

pub struct AllocationEngine {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    agent: Arc<dyn AgentClient>,
    registry: Arc<dyn ServiceRegistry>,
}

impl AllocationEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        agent: Arc<dyn AgentClient>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            agent,
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Subnets

    pub async fn create_subnet(&self, mut subnet: Subnet) -> Result<Subnet> {
        subnet.capacity = range::Capacity::ZERO;
        subnet.validate()?;

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx
            .subnets()
            .await?
            .into_iter()
            .find(|existing| existing.range().overlaps(&subnet.range()))
        {
            return Err(Error::Conflict {
                candidate: subnet.entity_ref().to_string(),
                existing: existing.entity_ref(),
            });
        }

        let nodes = self.resolve(&subnet).await?;
        tx.insert(Entity::from(subnet.clone())).await?;
        info!("Staged subnet {} ({})", subnet.prefix, subnet.id);

        let command = AgentCommand::Create {
            entity: Entity::from(subnet.clone()),
        };
        self.finish(tx, &nodes, command, RollbackPolicy::Compensate)
            .await?;
        Ok(subnet)
    }

    /// Replaces the options, lifetimes and pinned sentries of a subnet.
    /// Sentries dropped from `nodes` receive a delete once the update is
    /// committed.
    ///
    /// The prefix is immutable and the capacity is owned by the ledger, so
    /// both are taken from the stored subnet.
    pub async fn update_subnet(&self, mut subnet: Subnet) -> Result<Subnet> {
        let mut tx = self.store.begin().await?;
        let old = Self::load_subnet(tx.as_mut(), subnet.id).await?;
        if old.prefix != subnet.prefix {
            return Err(Error::validation(format!(
                "subnet prefix {} cannot be changed to {}",
                old.prefix, subnet.prefix
            )));
        }
        subnet.capacity = old.capacity;
        subnet.created_at = old.created_at;
        subnet.validate()?;

        let nodes = self.resolve(&subnet).await?;
        let removed: Vec<String> = old
            .nodes
            .iter()
            .filter(|node| !nodes.contains(node))
            .cloned()
            .collect();
        tx.update(Entity::from(subnet.clone())).await?;

        let old = Entity::from(old);
        let command = AgentCommand::Update {
            old: old.clone(),
            new: Entity::from(subnet.clone()),
        };
        self.finish(tx, &nodes, command, RollbackPolicy::Compensate)
            .await?;
        if !removed.is_empty() {
            self.withdraw(&removed, &old).await?;
        }
        Ok(subnet)
    }

    /// Deletes an empty subnet without live leases.
    pub async fn delete_subnet(&self, id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let subnet = Self::load_subnet(tx.as_mut(), id).await?;

        let children = tx.children(id).await?;
        if !children.is_empty() {
            return Err(Error::validation(format!(
                "subnet {} still has {} child entities",
                subnet.prefix,
                children.len()
            )));
        }

        let nodes = self.resolve(&subnet).await?;
        self.check_leases(&nodes, &Entity::from(subnet.clone()))
            .await?;

        tx.delete(id).await?;
        let command = AgentCommand::Delete {
            entity: Entity::from(subnet),
        };
        self.finish(tx, &nodes, command, RollbackPolicy::Compensate)
            .await
    }

    pub async fn get_subnet(&self, id: Uuid) -> Result<Subnet> {
        let mut tx = self.store.begin().await?;
        Self::load_subnet(tx.as_mut(), id).await
    }

    pub async fn list_subnets(&self) -> Result<Vec<Subnet>> {
        let mut tx = self.store.begin().await?;
        tx.subnets().await
    }

    // Pools

    pub async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        Pool::try_from(self.create_child(Entity::from(pool)).await?)
    }

    /// Updates the options and comment of a pool. Its range is immutable.
    pub async fn update_pool(&self, mut pool: Pool) -> Result<Pool> {
        let mut tx = self.store.begin().await?;
        let old = Pool::try_from(Self::load(tx.as_mut(), EntityKind::Pool, pool.id).await?)?;
        if old.subnet_id != pool.subnet_id || old.begin != pool.begin || old.end != pool.end {
            return Err(Error::validation(format!(
                "range of pool {} ({}) cannot be changed",
                old.id,
                old.range()
            )));
        }
        pool.capacity = old.capacity;
        pool.template = old.template.clone();
        Self::check_domain_servers(&pool)?;

        let subnet = Self::load_subnet(tx.as_mut(), pool.subnet_id).await?;
        let nodes = self.resolve(&subnet).await?;
        tx.update(Entity::from(pool.clone())).await?;

        let new = Entity::from(pool.clone());
        let policy = self.policy(&new);
        let command = AgentCommand::Update {
            old: Entity::from(old),
            new,
        };
        self.finish(tx, &nodes, command, policy).await?;
        Ok(pool)
    }

    pub async fn delete_pool(&self, id: Uuid) -> Result<()> {
        self.delete_child(EntityKind::Pool, id).await
    }

    pub async fn list_pools(&self, subnet_id: Uuid) -> Result<Vec<Pool>> {
        Ok(self.children(subnet_id).await?.pools)
    }

    // Reserved pools

    pub async fn create_reserved_pool(&self, pool: ReservedPool) -> Result<ReservedPool> {
        ReservedPool::try_from(self.create_child(Entity::from(pool)).await?)
    }

    pub async fn delete_reserved_pool(&self, id: Uuid) -> Result<()> {
        self.delete_child(EntityKind::ReservedPool, id).await
    }

    pub async fn list_reserved_pools(&self, subnet_id: Uuid) -> Result<Vec<ReservedPool>> {
        Ok(self.children(subnet_id).await?.reserved_pools)
    }

    // Reservations

    pub async fn create_reservation(&self, reservation: Reservation) -> Result<Reservation> {
        Reservation::try_from(self.create_child(Entity::from(reservation)).await?)
    }

    pub async fn delete_reservation(&self, id: Uuid) -> Result<()> {
        self.delete_child(EntityKind::Reservation, id).await
    }

    pub async fn list_reservations(&self, subnet_id: Uuid) -> Result<Vec<Reservation>> {
        Ok(self.children(subnet_id).await?.reservations)
    }

    // Prefix delegation

    pub async fn create_pd_pool(&self, pool: PdPool) -> Result<PdPool> {
        PdPool::try_from(self.create_child(Entity::from(pool)).await?)
    }

    pub async fn delete_pd_pool(&self, id: Uuid) -> Result<()> {
        self.delete_child(EntityKind::PdPool, id).await
    }

    pub async fn list_pd_pools(&self, subnet_id: Uuid) -> Result<Vec<PdPool>> {
        Ok(self.children(subnet_id).await?.pd_pools)
    }

    pub async fn create_reserved_pd_pool(&self, pool: ReservedPdPool) -> Result<ReservedPdPool> {
        ReservedPdPool::try_from(self.create_child(Entity::from(pool)).await?)
    }

    pub async fn delete_reserved_pd_pool(&self, id: Uuid) -> Result<()> {
        self.delete_child(EntityKind::ReservedPdPool, id).await
    }

    pub async fn list_reserved_pd_pools(&self, subnet_id: Uuid) -> Result<Vec<ReservedPdPool>> {
        Ok(self.children(subnet_id).await?.reserved_pd_pools)
    }

    // Templates

    pub async fn create_template(&self, template: PoolTemplate) -> Result<PoolTemplate> {
        template.validate()?;
        let mut tx = self.store.begin().await?;
        if tx.template(&template.name).await?.is_some() {
            return Err(Error::validation(format!(
                "template {} already exists",
                template.name
            )));
        }
        tx.put_template(template.clone()).await?;
        tx.commit().await?;
        info!("Created template {}", template.name);
        Ok(template)
    }

    pub async fn list_templates(&self) -> Result<Vec<PoolTemplate>> {
        let mut tx = self.store.begin().await?;
        tx.templates().await
    }

    pub async fn delete_template(&self, name: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if !tx.delete_template(name).await? {
            return Err(Error::not_found(EntityKind::Template, name));
        }
        tx.commit().await?;
        info!("Deleted template {}", name);
        Ok(())
    }

    /// Dry-runs a template against a subnet: the pool it would create is
    /// checked for containment and conflicts and returned with its
    /// capacity. Nothing is persisted.
    pub async fn validate_template(&self, name: &str, subnet_id: Uuid) -> Result<Pool> {
        let mut tx = self.store.begin().await?;
        let template = Self::load_template(tx.as_mut(), name).await?;
        let subnet = Self::load_subnet(tx.as_mut(), subnet_id).await?;
        let pool = template.instantiate(&subnet)?;

        let (entity, _) = Self::stage_child(tx.as_mut(), Entity::from(pool)).await?;
        Pool::try_from(entity)
    }

    pub async fn create_pool_from_template(&self, name: &str, subnet_id: Uuid) -> Result<Pool> {
        let mut tx = self.store.begin().await?;
        let template = Self::load_template(tx.as_mut(), name).await?;
        let subnet = Self::load_subnet(tx.as_mut(), subnet_id).await?;
        let pool = template.instantiate(&subnet)?;

        let entity = self.create_in(tx, Entity::from(pool)).await?;
        Pool::try_from(entity)
    }

    // Saga records

    /// Partially propagated mutations not yet repaired.
    pub async fn pending_rollbacks(&self) -> Result<Vec<PropagationRecord>> {
        let mut tx = self.store.begin().await?;
        Ok(tx
            .propagation_records()
            .await?
            .into_iter()
            .filter(|record| record.state == RecordState::Pending)
            .collect())
    }

    pub async fn resolve_rollback(&self, id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.resolve_propagation(id).await?;
        tx.commit().await
    }

    // Internals

    async fn create_child(&self, entity: Entity) -> Result<Entity> {
        let tx = self.store.begin().await?;
        self.create_in(tx, entity).await
    }

    async fn create_in(&self, mut tx: Box<dyn Transaction>, entity: Entity) -> Result<Entity> {
        let (entity, subnet) = Self::stage_child(tx.as_mut(), entity).await?;
        let nodes = self.resolve(&subnet).await?;

        let policy = self.policy(&entity);
        let command = AgentCommand::Create {
            entity: entity.clone(),
        };
        self.finish(tx, &nodes, command, policy).await?;
        Ok(entity)
    }

    /// Validates a new child, fixes its capacity and stages it together with
    /// the ledger updates. Returns the stored entity and its (pre-update)
    /// subnet.
    async fn stage_child(tx: &mut dyn Transaction, mut entity: Entity) -> Result<(Entity, Subnet)> {
        let subnet_id = entity
            .parent_id()
            .ok_or_else(|| Error::validation("subnets are created with create_subnet"))?;
        let subnet = Self::load_subnet(tx, subnet_id).await?;
        let siblings = tx.children(subnet_id).await?;

        Self::prepare(&mut entity, &siblings)?;
        conflict::check(&subnet, &entity, &siblings)?;

        let mut ledger = CapacityLedger::new(&subnet);
        match entity {
            Entity::Pool(_) | Entity::PdPool(_) => ledger.add_pool(&entity)?,
            _ => ledger.add_carve_out(&entity, &siblings)?,
        }

        tx.insert(entity.clone()).await?;
        Self::apply(tx, &ledger).await?;
        info!(
            "Staged {} in subnet {}: capacity {}, subnet capacity {}",
            entity.entity_ref(),
            subnet.prefix,
            entity.capacity(),
            ledger.subnet_capacity()
        );
        Ok((entity, subnet))
    }

    /// Kind-specific rules and the capacity the entity is stored with.
    fn prepare(entity: &mut Entity, siblings: &SubnetChildren) -> Result<()> {
        match entity {
            Entity::Subnet(_) => {
                return Err(Error::validation("subnets are created with create_subnet"));
            }
            Entity::Pool(pool) => {
                range::size(pool.begin, pool.end)?;
                Self::check_domain_servers(pool)?;
                pool.capacity = ledger::recalculate_pool(pool, siblings);
            }
            Entity::PdPool(pool) => {
                if let Some(reserved) = siblings.reserved_pd_pools.iter().find(|reserved| {
                    pool.ranges()[0].contains(&reserved.ranges()[0])
                        && reserved.delegated_len != pool.delegated_len
                }) {
                    return Err(Error::validation(format!(
                        "reserved pd-pool {} delegates /{} but the pd-pool delegates /{}",
                        reserved.prefix, reserved.delegated_len, pool.delegated_len
                    )));
                }
                pool.capacity = ledger::recalculate_pd_pool(pool, siblings)?;
            }
            Entity::ReservedPool(pool) => {
                pool.capacity = range::size(pool.begin, pool.end)?;
            }
            Entity::Reservation(reservation) => {
                reservation.validate()?;
                for prefix in &reservation.prefixes {
                    let item = AddressRange::from_prefix(&IpNet::V6(*prefix));
                    if let Some(pool) = siblings.pd_pools.iter().find(|pool| {
                        pool.ranges()[0].contains(&item)
                            && pool.delegated_len != prefix.prefix_len()
                    }) {
                        return Err(Error::validation(format!(
                            "reserved prefix {} does not match the /{} delegations of pd-pool {}",
                            prefix, pool.delegated_len, pool.prefix
                        )));
                    }
                }
                reservation.capacity = reservation.bound_count();
            }
            Entity::ReservedPdPool(reserved) => {
                if let Some(pool) = siblings.pd_pools.iter().find(|pool| {
                    pool.ranges()[0].contains(&reserved.ranges()[0])
                        && pool.delegated_len != reserved.delegated_len
                }) {
                    return Err(Error::validation(format!(
                        "reserved pd-pool delegates /{} but pd-pool {} delegates /{}",
                        reserved.delegated_len, pool.prefix, pool.delegated_len
                    )));
                }
                reserved.capacity =
                    range::pd_capacity(reserved.prefix.prefix_len(), reserved.delegated_len)?;
            }
        }
        Ok(())
    }

    fn check_domain_servers(pool: &Pool) -> Result<()> {
        let family = Family::of(pool.begin);
        if let Some(server) = pool
            .domain_servers
            .iter()
            .find(|server| Family::of(**server) != family)
        {
            return Err(Error::validation(format!(
                "domain server {} does not match the {} pool {}",
                server,
                family,
                pool.range()
            )));
        }
        Ok(())
    }

    async fn delete_child(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let entity = Self::load(tx.as_mut(), kind, id).await?;
        let subnet_id = entity
            .parent_id()
            .ok_or_else(|| Error::not_found(kind, id))?;
        let subnet = Self::load_subnet(tx.as_mut(), subnet_id).await?;
        let nodes = self.resolve(&subnet).await?;

        if matches!(
            kind,
            EntityKind::Pool | EntityKind::PdPool | EntityKind::Reservation
        ) {
            self.check_leases(&nodes, &entity).await?;
        }

        let siblings = tx.children(subnet_id).await?.without(id);
        let mut ledger = CapacityLedger::new(&subnet);
        match entity {
            Entity::Pool(_) | Entity::PdPool(_) => ledger.remove_pool(&entity)?,
            _ => ledger.remove_carve_out(&entity, &siblings)?,
        }

        tx.delete(id).await?;
        Self::apply(tx.as_mut(), &ledger).await?;
        info!(
            "Staged delete of {}, subnet capacity {}",
            entity.entity_ref(),
            ledger.subnet_capacity()
        );

        let policy = self.policy(&entity);
        self.finish(tx, &nodes, AgentCommand::Delete { entity }, policy)
            .await
    }

    async fn children(&self, subnet_id: Uuid) -> Result<SubnetChildren> {
        let mut tx = self.store.begin().await?;
        Self::load_subnet(tx.as_mut(), subnet_id).await?;
        tx.children(subnet_id).await
    }

    async fn load(tx: &mut dyn Transaction, kind: EntityKind, id: Uuid) -> Result<Entity> {
        match tx.get(id).await? {
            Some(entity) if entity.kind() == kind => Ok(entity),
            _ => Err(Error::not_found(kind, id)),
        }
    }

    async fn load_subnet(tx: &mut dyn Transaction, id: Uuid) -> Result<Subnet> {
        Subnet::try_from(Self::load(tx, EntityKind::Subnet, id).await?)
    }

    async fn load_template(tx: &mut dyn Transaction, name: &str) -> Result<PoolTemplate> {
        tx.template(name)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Template, name))
    }

    async fn apply(tx: &mut dyn Transaction, ledger: &CapacityLedger) -> Result<()> {
        for update in ledger.updates() {
            tx.update_capacity(update.id, update.capacity).await?;
        }
        Ok(())
    }

    async fn resolve(&self, subnet: &Subnet) -> Result<Vec<String>> {
        NodeResolver::new(self.registry.as_ref(), &self.config.registry.service)
            .resolve(subnet.family(), &subnet.nodes)
            .await
    }

    fn policy(&self, entity: &Entity) -> RollbackPolicy {
        RollbackPolicy::for_entity(entity, self.config.propagation.compensate_lightweight)
    }

    /// Sums live leases across `nodes`.
    async fn check_leases(&self, nodes: &[String], entity: &Entity) -> Result<()> {
        let query = LeaseQuery::for_entity(entity);
        let mut leases = 0u64;
        for node in nodes {
            leases = leases.saturating_add(self.agent.lease_count(node, &query).await?);
        }
        if leases > 0 {
            return Err(Error::CapacityExhausted {
                kind: entity.kind(),
                id: entity.id(),
                leases,
            });
        }
        Ok(())
    }

    async fn finish(
        &self,
        tx: Box<dyn Transaction>,
        nodes: &[String],
        command: AgentCommand,
        policy: RollbackPolicy,
    ) -> Result<()> {
        let outcome = Propagator::new(self.agent.as_ref())
            .propagate(nodes, &command, policy)
            .await;

        let state = outcome.state();
        match outcome {
            PropagationOutcome::Propagated { .. } => tx.commit().await,
            PropagationOutcome::Failed { error } => {
                warn!(
                    "{} {} {}, storage unchanged: {}",
                    command.operation(),
                    command.kind(),
                    state,
                    error
                );
                Err(error)
            }
            PropagationOutcome::Partial { record, error } => {
                Self::keep_record(tx, state, *record).await?;
                Err(error)
            }
        }
    }

    /// Deletes `entity` from nodes that stopped serving it after a committed
    /// change.
    async fn withdraw(&self, nodes: &[String], entity: &Entity) -> Result<()> {
        let outcome = Propagator::new(self.agent.as_ref())
            .withdraw(nodes, entity)
            .await;
        let state = outcome.state();
        match outcome {
            PropagationOutcome::Propagated { .. } => Ok(()),
            PropagationOutcome::Failed { error } => Err(error),
            PropagationOutcome::Partial { record, error } => {
                let tx = self.store.begin().await?;
                Self::keep_record(tx, state, *record).await?;
                Err(error)
            }
        }
    }

    /// Commits `tx` together with the saga record of a partial propagation.
    async fn keep_record(
        mut tx: Box<dyn Transaction>,
        state: PropagationState,
        record: PropagationRecord,
    ) -> Result<()> {
        error!(
            "{} {} {}, saga record {} (pending on {:?})",
            record.operation, record.kind, state, record.id, record.rollback_pending
        );
        tx.record_propagation(record).await?;
        tx.commit().await
    }
}
