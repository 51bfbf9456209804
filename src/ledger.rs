//! Capacity accounting between a subnet and its pools.
//!
//! A subnet's capacity is the number of addresses (and delegated prefixes)
//! clients can be given: the sum of its pools' and pd-pools' capacities plus
//! the capacities of its reservations. Carve-outs move capacity around
//! without creating any:
//!
//! | change | containing pool found | no containing pool |
//! |---|---|---|
//! | reservation item | pool −1, subnet unchanged | subnet +1 |
//! | reserved pool / pd-pool | pool −c, subnet −c | unchanged |
//!
//! Deletions apply the mirror image using the capacity recorded on the
//! entity when it was created, never a value recomputed from current state.
//!
//! The ledger only plans updates. The caller persists them through its open
//! transaction.

use std::collections::BTreeMap;

use ipnet::{IpNet, Ipv6Net};
use tracing::warn;
use uuid::Uuid;

use crate::conflict::{self, AddressItem, ItemRole};
use crate::error::{Error, Result};
use crate::model::{AddressEntity, Entity, EntityKind, PdPool, Pool, Subnet, SubnetChildren};
use crate::range::{self, AddressRange, Capacity};

/// New capacity for one entity, to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityUpdate {
    pub kind: EntityKind,
    pub id: Uuid,
    pub capacity: Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Create,
    Delete,
}

/// Pending capacity changes for one subnet and its pools.
#[derive(Debug, Clone)]
pub struct CapacityLedger {
    subnet_id: Uuid,
    subnet_before: Capacity,
    subnet: Capacity,
    pools: BTreeMap<Uuid, (EntityKind, Capacity, Capacity)>,
}

impl CapacityLedger {
    pub fn new(subnet: &Subnet) -> Self {
        Self {
            subnet_id: subnet.id,
            subnet_before: subnet.capacity,
            subnet: subnet.capacity,
            pools: BTreeMap::new(),
        }
    }

    /// Subnet capacity after the planned changes.
    pub fn subnet_capacity(&self) -> Capacity {
        self.subnet
    }

    /// Capacity of a pool after the planned changes, if it was touched.
    pub fn pool_capacity(&self, id: Uuid) -> Option<Capacity> {
        self.pools.get(&id).map(|(_, _, after)| *after)
    }

    /// Updates to persist, subnet first, untouched entities omitted.
    pub fn updates(&self) -> Vec<CapacityUpdate> {
        let mut updates = Vec::new();
        if self.subnet != self.subnet_before {
            updates.push(CapacityUpdate {
                kind: EntityKind::Subnet,
                id: self.subnet_id,
                capacity: self.subnet,
            });
        }
        updates.extend(
            self.pools
                .iter()
                .filter(|(_, (_, before, after))| before != after)
                .map(|(id, (kind, _, after))| CapacityUpdate {
                    kind: *kind,
                    id: *id,
                    capacity: *after,
                }),
        );
        updates
    }

    /// Accounts for a new pool or pd-pool whose capacity is already reduced
    /// by its carve-outs.
    pub fn add_pool(&mut self, pool: &Entity) -> Result<()> {
        Self::expect_pool(pool)?;
        self.subnet = self.subnet.saturating_add(pool.capacity());
        Ok(())
    }

    /// Reverses [`add_pool`](Self::add_pool) using the pool's recorded
    /// capacity.
    pub fn remove_pool(&mut self, pool: &Entity) -> Result<()> {
        Self::expect_pool(pool)?;
        self.subnet = Self::debit(self.subnet, pool.capacity(), EntityKind::Subnet, self.subnet_id);
        Ok(())
    }

    fn expect_pool(entity: &Entity) -> Result<()> {
        match entity {
            Entity::Pool(_) | Entity::PdPool(_) => Ok(()),
            other => Err(Error::validation(format!(
                "{} is not a pool and carries no subnet capacity of its own",
                other.kind()
            ))),
        }
    }

    /// Accounts for a new reservation, reserved pool or reserved pd-pool.
    pub fn add_carve_out(&mut self, entity: &Entity, siblings: &SubnetChildren) -> Result<()> {
        self.apply_carve_out(entity, siblings, Direction::Create)
    }

    /// Reverses [`add_carve_out`](Self::add_carve_out) using the entity's
    /// recorded capacity.
    pub fn remove_carve_out(&mut self, entity: &Entity, siblings: &SubnetChildren) -> Result<()> {
        self.apply_carve_out(entity, siblings, Direction::Delete)
    }

    fn apply_carve_out(
        &mut self,
        entity: &Entity,
        siblings: &SubnetChildren,
        direction: Direction,
    ) -> Result<()> {
        match entity {
            Entity::Reservation(_) => {
                let recorded = entity.capacity();
                let mut absorbed = Capacity::ZERO;
                for item in conflict::items(entity) {
                    if let Some((kind, id, capacity)) = containing_pool(&item, siblings) {
                        self.shift_pool(kind, id, capacity, Capacity::new(1), direction);
                        absorbed = absorbed.saturating_add(Capacity::new(1));
                    }
                }

                let direct = recorded.saturating_sub(absorbed);
                self.subnet = match direction {
                    Direction::Create => self.subnet.saturating_add(direct),
                    Direction::Delete => {
                        Self::debit(self.subnet, direct, EntityKind::Subnet, self.subnet_id)
                    }
                };
            }
            Entity::ReservedPool(_) | Entity::ReservedPdPool(_) => {
                let recorded = entity.capacity();
                let item = conflict::items(entity)
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::validation(format!("{} has no range", entity.kind())))?;

                if let Some((kind, id, capacity)) = containing_pool(&item, siblings) {
                    self.shift_pool(kind, id, capacity, recorded, direction);
                    self.subnet = match direction {
                        Direction::Create => {
                            Self::debit(self.subnet, recorded, EntityKind::Subnet, self.subnet_id)
                        }
                        Direction::Delete => self.subnet.saturating_add(recorded),
                    };
                }
            }
            other => {
                return Err(Error::validation(format!(
                    "{} is not a carve-out",
                    other.kind()
                )));
            }
        }
        Ok(())
    }

    fn shift_pool(
        &mut self,
        kind: EntityKind,
        id: Uuid,
        stored: Capacity,
        amount: Capacity,
        direction: Direction,
    ) {
        let entry = self.pools.entry(id).or_insert((kind, stored, stored));
        entry.2 = match direction {
            Direction::Create => Self::debit(entry.2, amount, kind, id),
            Direction::Delete => entry.2.saturating_add(amount),
        };
    }

    fn debit(current: Capacity, amount: Capacity, kind: EntityKind, id: Uuid) -> Capacity {
        current.checked_sub(amount).unwrap_or_else(|| {
            warn!(
                "Capacity of {} {} would drop below zero ({} - {}), clamping",
                kind, id, current, amount
            );
            Capacity::ZERO
        })
    }
}

/// Finds the pool (for addresses and reserved ranges) or pd-pool (for
/// prefixes) that absorbs `item`.
fn containing_pool(
    item: &AddressItem,
    siblings: &SubnetChildren,
) -> Option<(EntityKind, Uuid, Capacity)> {
    match item.role {
        ItemRole::ReservedAddress | ItemRole::ReservedPool => siblings
            .pools
            .iter()
            .find(|pool| pool.range().contains(&item.range))
            .map(|pool| (EntityKind::Pool, pool.id, pool.capacity)),
        ItemRole::ReservedPrefix | ItemRole::ReservedPdPool => siblings
            .pd_pools
            .iter()
            .find(|pool| pool.ranges()[0].contains(&item.range))
            .map(|pool| (EntityKind::PdPool, pool.id, pool.capacity)),
        ItemRole::Pool | ItemRole::PdPool => None,
    }
}

/// Capacity of a new pool: its full size minus every reservation address
/// and reserved pool it contains.
pub fn recalculate_pool(pool: &Pool, siblings: &SubnetChildren) -> Capacity {
    let span = pool.range();
    let reserved_addresses = siblings
        .reservations
        .iter()
        .flat_map(|reservation| reservation.addresses.iter())
        .filter(|addr| span.contains_addr(**addr))
        .count();
    let reserved_ranges: Capacity = siblings
        .reserved_pools
        .iter()
        .filter(|reserved| span.contains(&reserved.range()))
        .map(|reserved| reserved.capacity)
        .sum();

    span.size()
        .saturating_sub(Capacity::new(reserved_addresses as u128))
        .saturating_sub(reserved_ranges)
}

/// Capacity of a new pd-pool: its delegation count minus every reservation
/// prefix and reserved pd-pool it contains.
pub fn recalculate_pd_pool(pool: &PdPool, siblings: &SubnetChildren) -> Result<Capacity> {
    let span = pool.ranges()[0];
    let full = range::pd_capacity(pool.prefix.prefix_len(), pool.delegated_len)?;

    let contained: Vec<&Ipv6Net> = siblings
        .reservations
        .iter()
        .flat_map(|reservation| reservation.prefixes.iter())
        .filter(|prefix| span.contains(&AddressRange::from_prefix(&IpNet::V6(**prefix))))
        .collect();
    if let Some(prefix) = contained
        .iter()
        .find(|prefix| prefix.prefix_len() != pool.delegated_len)
    {
        return Err(Error::validation(format!(
            "reserved prefix {} does not match the /{} delegations of pd-pool {}",
            prefix, pool.delegated_len, pool.prefix
        )));
    }
    let reserved_prefixes = contained.len();
    let reserved_ranges: Capacity = siblings
        .reserved_pd_pools
        .iter()
        .filter(|reserved| span.contains(&reserved.ranges()[0]))
        .map(|reserved| reserved.capacity)
        .sum();

    Ok(full
        .saturating_sub(Capacity::new(reserved_prefixes as u128))
        .saturating_sub(reserved_ranges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientId, Lifetimes, Reservation, ReservedPdPool, ReservedPool};

    fn subnet(prefix: &str) -> Subnet {
        Subnet::new(prefix.parse().unwrap(), Lifetimes::default()).unwrap()
    }

    fn pool(subnet: &Subnet, begin: &str, end: &str) -> Pool {
        Pool::new(subnet.id, begin.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_pool_creation_grows_subnet() {
        let subnet = subnet("10.0.0.0/24");
        let mut ledger = CapacityLedger::new(&subnet);
        ledger.add_pool(&Entity::from(pool(&subnet, "10.0.0.10", "10.0.0.20"))).unwrap();
        assert_eq!(ledger.subnet_capacity(), Capacity::new(11));
        assert_eq!(
            ledger.updates(),
            vec![CapacityUpdate {
                kind: EntityKind::Subnet,
                id: subnet.id,
                capacity: Capacity::new(11),
            }]
        );
    }

    #[test]
    fn test_reservation_inside_pool_moves_capacity_from_pool() {
        let mut subnet = subnet("10.0.0.0/24");
        subnet.capacity = Capacity::new(11);
        let pool = pool(&subnet, "10.0.0.10", "10.0.0.20");
        let siblings = SubnetChildren {
            pools: vec![pool.clone()],
            ..Default::default()
        };
        let reservation = Entity::from(
            Reservation::v4(subnet.id, "aa:bb:cc:dd:ee:ff", "10.0.0.15".parse().unwrap()).unwrap(),
        );

        let mut ledger = CapacityLedger::new(&subnet);
        ledger.add_carve_out(&reservation, &siblings).unwrap();
        assert_eq!(ledger.subnet_capacity(), Capacity::new(11));
        assert_eq!(ledger.pool_capacity(pool.id), Some(Capacity::new(10)));
        assert_eq!(ledger.updates().len(), 1);

        let mut shrunk = pool.clone();
        shrunk.capacity = Capacity::new(10);
        let siblings = SubnetChildren {
            pools: vec![shrunk],
            ..Default::default()
        };
        let mut ledger = CapacityLedger::new(&subnet);
        ledger.remove_carve_out(&reservation, &siblings).unwrap();
        assert_eq!(ledger.pool_capacity(pool.id), Some(Capacity::new(11)));
        assert_eq!(ledger.subnet_capacity(), Capacity::new(11));
    }

    #[test]
    fn test_reservation_outside_pools_grows_subnet() {
        let subnet = subnet("10.0.0.0/24");
        let reservation = Entity::from(
            Reservation::v4(subnet.id, "aa:bb:cc:dd:ee:ff", "10.0.0.200".parse().unwrap()).unwrap(),
        );
        let mut ledger = CapacityLedger::new(&subnet);
        ledger.add_carve_out(&reservation, &SubnetChildren::default()).unwrap();
        assert_eq!(ledger.subnet_capacity(), Capacity::new(1));
    }

    #[test]
    fn test_reserved_pool_inside_pool_shrinks_both() {
        let mut subnet = subnet("10.0.0.0/24");
        subnet.capacity = Capacity::new(11);
        let pool = pool(&subnet, "10.0.0.10", "10.0.0.20");
        let siblings = SubnetChildren {
            pools: vec![pool.clone()],
            ..Default::default()
        };
        let reserved = Entity::from(
            ReservedPool::new(
                subnet.id,
                "10.0.0.12".parse().unwrap(),
                "10.0.0.14".parse().unwrap(),
            )
            .unwrap(),
        );

        let mut ledger = CapacityLedger::new(&subnet);
        ledger.add_carve_out(&reserved, &siblings).unwrap();
        assert_eq!(ledger.pool_capacity(pool.id), Some(Capacity::new(8)));
        assert_eq!(ledger.subnet_capacity(), Capacity::new(8));
    }

    #[test]
    fn test_reserved_pool_outside_pools_leaves_subnet() {
        let subnet = subnet("10.0.0.0/24");
        let reserved = Entity::from(
            ReservedPool::new(
                subnet.id,
                "10.0.0.100".parse().unwrap(),
                "10.0.0.110".parse().unwrap(),
            )
            .unwrap(),
        );
        let mut ledger = CapacityLedger::new(&subnet);
        ledger.add_carve_out(&reserved, &SubnetChildren::default()).unwrap();
        assert!(ledger.updates().is_empty());
    }

    #[test]
    fn test_recalculate_pool_subtracts_contained_carve_outs() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            reserved_pools: vec![
                ReservedPool::new(
                    subnet.id,
                    "10.0.0.40".parse().unwrap(),
                    "10.0.0.44".parse().unwrap(),
                )
                .unwrap(),
            ],
            reservations: vec![
                Reservation::v4(subnet.id, "aa:bb:cc:dd:ee:01", "10.0.0.50".parse().unwrap())
                    .unwrap(),
                Reservation::v4(subnet.id, "aa:bb:cc:dd:ee:02", "10.0.0.99".parse().unwrap())
                    .unwrap(),
            ],
            ..Default::default()
        };
        let candidate = pool(&subnet, "10.0.0.30", "10.0.0.69");
        assert_eq!(recalculate_pool(&candidate, &siblings), Capacity::new(40 - 5 - 1));
    }

    #[test]
    fn test_pd_pool_accounting() {
        let subnet = subnet("2001:db8::/32");
        let pd = PdPool::new(subnet.id, "2001:db8:1::/48".parse().unwrap(), 56).unwrap();
        let siblings = SubnetChildren {
            reserved_pd_pools: vec![
                ReservedPdPool::new(subnet.id, "2001:db8:1::/52".parse().unwrap(), 56).unwrap(),
            ],
            reservations: vec![
                Reservation::v6(
                    subnet.id,
                    ClientId::Duid("00:01".to_string()),
                    vec![],
                    vec!["2001:db8:1:ff00::/56".parse().unwrap()],
                )
                .unwrap(),
            ],
            ..Default::default()
        };
        assert_eq!(recalculate_pd_pool(&pd, &siblings).unwrap(), Capacity::new(256 - 16 - 1));

        let mut ledger = CapacityLedger::new(&subnet);
        let reservation = Entity::from(
            Reservation::v6(
                subnet.id,
                ClientId::Duid("00:02".to_string()),
                vec!["2001:db8::5".parse().unwrap()],
                vec!["2001:db8:1:2000::/56".parse().unwrap()],
            )
            .unwrap(),
        );
        let siblings = SubnetChildren {
            pd_pools: vec![pd.clone()],
            ..Default::default()
        };
        ledger.add_carve_out(&reservation, &siblings).unwrap();
        assert_eq!(ledger.pool_capacity(pd.id), Some(Capacity::new(255)));
        assert_eq!(ledger.subnet_capacity(), Capacity::new(1));
    }

    #[test]
    fn test_pd_pool_rejects_wider_reserved_prefix() {
        let subnet = subnet("2001:db8::/32");
        let pd = PdPool::new(subnet.id, "2001:db8::/40".parse().unwrap(), 56).unwrap();
        let siblings = SubnetChildren {
            reservations: vec![
                Reservation::v6(
                    subnet.id,
                    ClientId::Duid("00:03".to_string()),
                    vec![],
                    vec!["2001:db8::/48".parse().unwrap()],
                )
                .unwrap(),
            ],
            ..Default::default()
        };
        assert!(matches!(
            recalculate_pd_pool(&pd, &siblings),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_pool_removal_clamps_at_zero() {
        let subnet = subnet("10.0.0.0/24");
        let mut ledger = CapacityLedger::new(&subnet);
        ledger.remove_pool(&Entity::from(pool(&subnet, "10.0.0.10", "10.0.0.20"))).unwrap();
        assert_eq!(ledger.subnet_capacity(), Capacity::ZERO);
    }

    #[test]
    fn test_rejects_wrong_entity_kinds() {
        let subnet = subnet("10.0.0.0/24");
        let mut ledger = CapacityLedger::new(&subnet);
        let pool = Entity::from(pool(&subnet, "10.0.0.10", "10.0.0.20"));
        assert!(ledger.add_carve_out(&pool, &SubnetChildren::default()).is_err());
        assert!(ledger.add_pool(&Entity::from(subnet.clone())).is_err());
    }
}
