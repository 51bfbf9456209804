//! Conflict detection between a candidate entity and its subnet siblings.
//!
//! Entities are decomposed into address items (one per pool range, one per
//! reservation address or prefix). Two items conflict when they overlap and
//! neither absorbs the other, where absorbing means a pool fully containing
//! one of its carve-outs:
//!
//! - a pool absorbs a reserved pool or a reserved address inside it
//! - a pd-pool absorbs a reserved pd-pool or a reserved prefix inside it
//!
//! Siblings are scanned in reporting priority order (reserved pool, pool,
//! reservation, pd-pool, reserved pd-pool) and the first hit is returned.

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AddressEntity, Entity, EntityRef, Reservation, Subnet, SubnetChildren};
use crate::range::AddressRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRole {
    Pool,
    ReservedPool,
    PdPool,
    ReservedPdPool,
    ReservedAddress,
    ReservedPrefix,
}

/// One address span of an entity together with the role it plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressItem {
    pub role: ItemRole,
    pub range: AddressRange,
}

/// Splits an entity into its address items.
pub fn items(entity: &Entity) -> Vec<AddressItem> {
    let single = |role, range| vec![AddressItem { role, range }];
    match entity {
        Entity::Subnet(_) => Vec::new(),
        Entity::Pool(pool) => single(ItemRole::Pool, pool.range()),
        Entity::ReservedPool(pool) => single(ItemRole::ReservedPool, pool.range()),
        Entity::PdPool(pool) => single(ItemRole::PdPool, pool.ranges()[0]),
        Entity::ReservedPdPool(pool) => single(ItemRole::ReservedPdPool, pool.ranges()[0]),
        Entity::Reservation(reservation) => reservation_items(reservation),
    }
}

fn reservation_items(reservation: &Reservation) -> Vec<AddressItem> {
    let address_count = reservation.addresses.len();
    reservation
        .ranges()
        .into_iter()
        .enumerate()
        .map(|(index, range)| AddressItem {
            role: if index < address_count {
                ItemRole::ReservedAddress
            } else {
                ItemRole::ReservedPrefix
            },
            range,
        })
        .collect()
}

/// True when `container` is a pool that legitimately holds `inner`.
pub fn absorbs(container: &AddressItem, inner: &AddressItem) -> bool {
    use ItemRole::*;

    matches!(
        (container.role, inner.role),
        (Pool, ReservedPool)
            | (Pool, ReservedAddress)
            | (PdPool, ReservedPdPool)
            | (PdPool, ReservedPrefix)
    ) && container.range.contains(&inner.range)
}

pub fn items_conflict(a: &AddressItem, b: &AddressItem) -> bool {
    a.range.overlaps(&b.range) && !absorbs(a, b) && !absorbs(b, a)
}

fn entities_conflict(candidate: &[AddressItem], existing: &Entity) -> bool {
    let existing = items(existing);
    candidate
        .iter()
        .any(|item| existing.iter().any(|other| items_conflict(item, other)))
}

/// Checks that the candidate is the subnet's family and lies entirely
/// inside the subnet prefix.
///
/// # Errors
///
/// Returns [`Error::Validation`]; containment failures are not conflicts.
pub fn check_containment(subnet: &Subnet, candidate: &Entity) -> Result<()> {
    if candidate.family() != subnet.family() {
        return Err(Error::validation(format!(
            "{} is {} but subnet {} is {}",
            candidate.kind(),
            candidate.family(),
            subnet.prefix,
            subnet.family()
        )));
    }

    let outer = subnet.range();
    if let Some(range) = candidate.ranges().iter().find(|range| !outer.contains(range)) {
        return Err(Error::validation(format!(
            "{} {} is not contained in subnet {}",
            candidate.kind(),
            range,
            subnet.prefix
        )));
    }
    Ok(())
}

/// Returns the first sibling conflicting with `candidate`, in reporting
/// priority order. The candidate's own id is skipped so updates can be
/// checked against the stored state.
pub fn find_conflict(candidate: &Entity, siblings: &SubnetChildren) -> Option<EntityRef> {
    let candidate_items = items(candidate);
    let candidate_id = candidate.id();

    let ordered = siblings
        .reserved_pools
        .iter()
        .cloned()
        .map(Entity::from)
        .chain(siblings.pools.iter().cloned().map(Entity::from))
        .chain(siblings.reservations.iter().cloned().map(Entity::from))
        .chain(siblings.pd_pools.iter().cloned().map(Entity::from))
        .chain(siblings.reserved_pd_pools.iter().cloned().map(Entity::from));

    for existing in ordered.filter(|existing| existing.id() != candidate_id) {
        if entities_conflict(&candidate_items, &existing) {
            return Some(existing.entity_ref());
        }
    }

    if let Entity::Reservation(reservation) = candidate {
        return duplicate_client(reservation, &siblings.reservations, candidate_id);
    }

    None
}

fn duplicate_client(
    reservation: &Reservation,
    reservations: &[Reservation],
    candidate_id: Uuid,
) -> Option<EntityRef> {
    let key = reservation.client_key()?;
    reservations
        .iter()
        .filter(|existing| existing.id != candidate_id)
        .find(|existing| existing.client_key() == Some(key))
        .map(|existing| existing.entity_ref())
}

/// Runs containment and sibling checks for a candidate under `subnet`.
///
/// # Errors
///
/// - [`Error::Validation`] when the candidate leaves the subnet prefix
/// - [`Error::Conflict`] naming the first conflicting sibling
pub fn check(subnet: &Subnet, candidate: &Entity, siblings: &SubnetChildren) -> Result<()> {
    check_containment(subnet, candidate)?;

    if let Some(existing) = find_conflict(candidate, siblings) {
        let candidate = candidate.entity_ref();
        debug!("{} rejected, conflicts with {}", candidate, existing);
        return Err(Error::Conflict {
            candidate: candidate.to_string(),
            existing,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientId, EntityKind, Lifetimes, PdPool, Pool, ReservedPdPool, ReservedPool};

    fn subnet(prefix: &str) -> Subnet {
        Subnet::new(prefix.parse().unwrap(), Lifetimes::default()).unwrap()
    }

    fn pool(subnet: &Subnet, begin: &str, end: &str) -> Pool {
        Pool::new(subnet.id, begin.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    fn reserved(subnet: &Subnet, begin: &str, end: &str) -> ReservedPool {
        ReservedPool::new(subnet.id, begin.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    fn reservation(subnet: &Subnet, mac: &str, address: &str) -> Reservation {
        Reservation::v4(subnet.id, mac, address.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_disjoint_pools_do_not_conflict() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            pools: vec![pool(&subnet, "10.0.0.10", "10.0.0.20")],
            ..Default::default()
        };
        let candidate = Entity::from(pool(&subnet, "10.0.0.21", "10.0.0.30"));
        assert!(check(&subnet, &candidate, &siblings).is_ok());
    }

    #[test]
    fn test_overlapping_pool_names_existing_pool() {
        let subnet = subnet("10.0.0.0/24");
        let existing = pool(&subnet, "10.0.0.10", "10.0.0.20");
        let siblings = SubnetChildren {
            pools: vec![existing.clone()],
            ..Default::default()
        };
        let candidate = Entity::from(pool(&subnet, "10.0.0.20", "10.0.0.40"));
        match check(&subnet, &candidate, &siblings) {
            Err(Error::Conflict { existing: found, .. }) => {
                assert_eq!(found.kind, EntityKind::Pool);
                assert_eq!(found.id, existing.id);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_containment_is_distinct_from_conflict() {
        let subnet = subnet("10.0.0.0/24");
        let candidate = Entity::from(pool(&subnet, "10.0.0.250", "10.0.1.5"));
        assert!(matches!(
            check(&subnet, &candidate, &SubnetChildren::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_family_mismatch_is_validation_error() {
        let subnet = subnet("10.0.0.0/24");
        let candidate = Entity::from(pool(&subnet, "fd00::1", "fd00::5"));
        assert!(matches!(
            check_containment(&subnet, &candidate),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_reservation_inside_pool_is_absorbed() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            pools: vec![pool(&subnet, "10.0.0.10", "10.0.0.20")],
            ..Default::default()
        };
        let candidate = Entity::from(reservation(&subnet, "aa:bb:cc:dd:ee:ff", "10.0.0.15"));
        assert!(find_conflict(&candidate, &siblings).is_none());
    }

    #[test]
    fn test_reserved_pool_straddling_pool_conflicts() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            pools: vec![pool(&subnet, "10.0.0.10", "10.0.0.20")],
            ..Default::default()
        };
        let straddling = Entity::from(reserved(&subnet, "10.0.0.5", "10.0.0.12"));
        assert_eq!(
            find_conflict(&straddling, &siblings).map(|found| found.kind),
            Some(EntityKind::Pool)
        );

        let inside = Entity::from(reserved(&subnet, "10.0.0.12", "10.0.0.14"));
        assert!(find_conflict(&inside, &siblings).is_none());
    }

    #[test]
    fn test_reservation_inside_reserved_pool_conflicts() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            reserved_pools: vec![reserved(&subnet, "10.0.0.40", "10.0.0.50")],
            ..Default::default()
        };
        let candidate = Entity::from(reservation(&subnet, "aa:bb:cc:dd:ee:ff", "10.0.0.45"));
        assert_eq!(
            find_conflict(&candidate, &siblings).map(|found| found.kind),
            Some(EntityKind::ReservedPool)
        );
    }

    #[test]
    fn test_pool_swallowing_reserved_pool_is_allowed() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            reserved_pools: vec![reserved(&subnet, "10.0.0.40", "10.0.0.50")],
            reservations: vec![reservation(&subnet, "aa:bb:cc:dd:ee:01", "10.0.0.60")],
            ..Default::default()
        };
        let candidate = Entity::from(pool(&subnet, "10.0.0.30", "10.0.0.70"));
        assert!(find_conflict(&candidate, &siblings).is_none());
    }

    #[test]
    fn test_reserved_pool_takes_reporting_priority() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            pools: vec![pool(&subnet, "10.0.0.10", "10.0.0.20")],
            reserved_pools: vec![reserved(&subnet, "10.0.0.21", "10.0.0.30")],
            ..Default::default()
        };
        let candidate = Entity::from(pool(&subnet, "10.0.0.15", "10.0.0.25"));
        assert_eq!(
            find_conflict(&candidate, &siblings).map(|found| found.kind),
            Some(EntityKind::ReservedPool)
        );
    }

    #[test]
    fn test_duplicate_reservation_address_and_client() {
        let subnet = subnet("10.0.0.0/24");
        let siblings = SubnetChildren {
            reservations: vec![reservation(&subnet, "aa:bb:cc:dd:ee:01", "10.0.0.60")],
            ..Default::default()
        };
        let same_address = Entity::from(reservation(&subnet, "aa:bb:cc:dd:ee:02", "10.0.0.60"));
        assert!(find_conflict(&same_address, &siblings).is_some());

        let same_client = Entity::from(reservation(&subnet, "AA:BB:CC:DD:EE:01", "10.0.0.61"));
        assert!(find_conflict(&same_client, &siblings).is_some());
    }

    #[test]
    fn test_update_skips_itself() {
        let subnet = subnet("10.0.0.0/24");
        let existing = pool(&subnet, "10.0.0.10", "10.0.0.20");
        let siblings = SubnetChildren {
            pools: vec![existing.clone()],
            ..Default::default()
        };
        assert!(find_conflict(&Entity::from(existing), &siblings).is_none());
    }

    #[test]
    fn test_prefix_delegation_rules() {
        let subnet = subnet("2001:db8::/32");
        let pd = PdPool::new(subnet.id, "2001:db8:1::/48".parse().unwrap(), 56).unwrap();
        let siblings = SubnetChildren {
            pd_pools: vec![pd],
            ..Default::default()
        };

        let reserved_inside = Entity::from(
            ReservedPdPool::new(subnet.id, "2001:db8:1::/52".parse().unwrap(), 56).unwrap(),
        );
        assert!(find_conflict(&reserved_inside, &siblings).is_none());

        let reserved_straddling = Entity::from(
            ReservedPdPool::new(subnet.id, "2001:db8::/47".parse().unwrap(), 56).unwrap(),
        );
        assert!(find_conflict(&reserved_straddling, &siblings).is_some());

        let overlapping_pd = Entity::from(
            PdPool::new(subnet.id, "2001:db8:1:100::/56".parse().unwrap(), 64).unwrap(),
        );
        assert!(find_conflict(&overlapping_pd, &siblings).is_some());

        let prefix_reservation = Entity::from(
            Reservation::v6(
                subnet.id,
                ClientId::Duid("00:01:02".to_string()),
                vec![],
                vec!["2001:db8:1:200::/56".parse().unwrap()],
            )
            .unwrap(),
        );
        assert!(find_conflict(&prefix_reservation, &siblings).is_none());

        let address_pool = Entity::from(pool(&subnet, "2001:db8:1::1", "2001:db8:1::ff"));
        assert_eq!(
            find_conflict(&address_pool, &siblings).map(|found| found.kind),
            Some(EntityKind::PdPool)
        );
    }
}
