//! Address entities managed by the engine.
//!
//! Every kind is a plain serializable struct. The [`Entity`] union carries
//! them across the storage and agent boundaries, and the [`AddressEntity`]
//! trait exposes the kind-agnostic view (ranges, parent, capacity) that
//! conflict detection and capacity accounting work against.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv6Net};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::range::{self, AddressRange, Capacity, Family};

const MAX_DUID_BYTES: usize = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Subnet,
    Pool,
    ReservedPool,
    Reservation,
    PdPool,
    ReservedPdPool,
    Template,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Subnet => "subnet",
            EntityKind::Pool => "pool",
            EntityKind::ReservedPool => "reserved pool",
            EntityKind::Reservation => "reservation",
            EntityKind::PdPool => "pd-pool",
            EntityKind::ReservedPdPool => "reserved pd-pool",
            EntityKind::Template => "template",
        };
        f.write_str(name)
    }
}

/// Identity of an entity, used in conflict errors and saga records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
    pub range: String,
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.id, self.range)
    }
}

/// Kind-agnostic view of an address entity.
pub trait AddressEntity {
    fn kind(&self) -> EntityKind;

    fn id(&self) -> Uuid;

    /// Owning subnet, `None` for subnets themselves.
    fn parent_id(&self) -> Option<Uuid>;

    fn family(&self) -> Family;

    fn capacity(&self) -> Capacity;

    fn set_capacity(&mut self, capacity: Capacity);

    /// Address spans covered by the entity.
    ///
    /// Reservations return their addresses first, then their prefixes.
    fn ranges(&self) -> Vec<AddressRange>;

    fn entity_ref(&self) -> EntityRef {
        let range = self
            .ranges()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        EntityRef {
            kind: self.kind(),
            id: self.id(),
            range,
        }
    }
}

/// Lease lifetimes handed to clients of a subnet, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetimes {
    pub valid: u32,
    pub max_valid: u32,
    pub min_valid: u32,
    /// DHCPv6 only.
    #[serde(default)]
    pub preferred: Option<u32>,
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            valid: 14400,
            max_valid: 28800,
            min_valid: 10800,
            preferred: None,
        }
    }
}

impl Lifetimes {
    pub fn validate(&self, family: Family) -> Result<()> {
        if self.min_valid > self.valid || self.valid > self.max_valid {
            return Err(Error::validation(format!(
                "lifetimes must satisfy min ({}) <= valid ({}) <= max ({})",
                self.min_valid, self.valid, self.max_valid
            )));
        }

        match (family, self.preferred) {
            (Family::V4, Some(_)) => Err(Error::validation(
                "preferred lifetime only applies to IPv6 subnets",
            )),
            (Family::V6, Some(preferred)) if preferred > self.valid => Err(Error::validation(
                format!(
                    "preferred lifetime {} exceeds valid lifetime {}",
                    preferred, self.valid
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Uuid,
    pub prefix: IpNet,
    /// Sentry nodes pinned by the admin.
    #[serde(default)]
    pub nodes: Vec<String>,
    pub capacity: Capacity,
    pub lifetimes: Lifetimes,
    #[serde(default)]
    pub domain_servers: Vec<IpAddr>,
    #[serde(default)]
    pub routers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

impl Subnet {
    /// Creates a subnet with zero capacity.
    ///
    /// The prefix must be given by its network address (`10.0.0.0/24`, not
    /// `10.0.0.1/24`).
    pub fn new(prefix: IpNet, lifetimes: Lifetimes) -> Result<Self> {
        if prefix != prefix.trunc() {
            return Err(Error::validation(format!(
                "{} is not a network address, expected {}",
                prefix,
                prefix.trunc()
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            prefix,
            nodes: Vec::new(),
            capacity: Capacity::ZERO,
            lifetimes,
            domain_servers: Vec::new(),
            routers: Vec::new(),
            tags: Vec::new(),
            comment: String::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::from_prefix(&self.prefix)
    }

    pub fn validate(&self) -> Result<()> {
        self.lifetimes.validate(self.family())?;

        if self.family() == Family::V6 && !self.routers.is_empty() {
            return Err(Error::validation("routers only apply to IPv4 subnets"));
        }

        if let Some(server) = self
            .domain_servers
            .iter()
            .find(|server| Family::of(**server) != self.family())
        {
            return Err(Error::validation(format!(
                "domain server {} does not match the {} subnet {}",
                server,
                self.family(),
                self.prefix
            )));
        }

        Ok(())
    }
}

impl AddressEntity for Subnet {
    fn kind(&self) -> EntityKind {
        EntityKind::Subnet
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Option<Uuid> {
        None
    }

    fn family(&self) -> Family {
        Family::of_net(&self.prefix)
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    fn ranges(&self) -> Vec<AddressRange> {
        vec![self.range()]
    }
}

/// Dynamic address range handed out by the agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub subnet_id: Uuid,
    pub begin: IpAddr,
    pub end: IpAddr,
    pub capacity: Capacity,
    #[serde(default)]
    pub domain_servers: Vec<IpAddr>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub comment: String,
}

impl Pool {
    pub fn new(subnet_id: Uuid, begin: IpAddr, end: IpAddr) -> Result<Self> {
        let capacity = range::size(begin, end)?;
        Ok(Self {
            id: Uuid::new_v4(),
            subnet_id,
            begin,
            end,
            capacity,
            domain_servers: Vec::new(),
            template: None,
            comment: String::new(),
        })
    }

    /// Ranges are checked on construction and on load; a reversed range
    /// collapses to its begin address.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.begin, self.end)
            .unwrap_or_else(|_| AddressRange::single(self.begin))
    }
}

impl AddressEntity for Pool {
    fn kind(&self) -> EntityKind {
        EntityKind::Pool
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Option<Uuid> {
        Some(self.subnet_id)
    }

    fn family(&self) -> Family {
        Family::of(self.begin)
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    fn ranges(&self) -> Vec<AddressRange> {
        vec![self.range()]
    }
}

/// Administratively excluded range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedPool {
    pub id: Uuid,
    pub subnet_id: Uuid,
    pub begin: IpAddr,
    pub end: IpAddr,
    pub capacity: Capacity,
    #[serde(default)]
    pub comment: String,
}

impl ReservedPool {
    pub fn new(subnet_id: Uuid, begin: IpAddr, end: IpAddr) -> Result<Self> {
        let capacity = range::size(begin, end)?;
        Ok(Self {
            id: Uuid::new_v4(),
            subnet_id,
            begin,
            end,
            capacity,
            comment: String::new(),
        })
    }

    /// Ranges are checked on construction and on load; a reversed range
    /// collapses to its begin address.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.begin, self.end)
            .unwrap_or_else(|_| AddressRange::single(self.begin))
    }
}

impl AddressEntity for ReservedPool {
    fn kind(&self) -> EntityKind {
        EntityKind::ReservedPool
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Option<Uuid> {
        Some(self.subnet_id)
    }

    fn family(&self) -> Family {
        Family::of(self.begin)
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    fn ranges(&self) -> Vec<AddressRange> {
        vec![self.range()]
    }
}

/// Fixed binding of a client identifier to addresses and, for v6, prefixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub subnet_id: Uuid,
    #[serde(default)]
    pub hw_address: Option<String>,
    #[serde(default)]
    pub duid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub prefixes: Vec<Ipv6Net>,
    pub capacity: Capacity,
    #[serde(default)]
    pub comment: String,
}

impl Reservation {
    /// Creates a v4 reservation binding `hw_address` to `address`.
    pub fn v4(subnet_id: Uuid, hw_address: &str, address: Ipv4Addr) -> Result<Self> {
        let reservation = Self {
            id: Uuid::new_v4(),
            subnet_id,
            hw_address: Some(normalize_hw_address(hw_address)?),
            duid: None,
            hostname: None,
            addresses: vec![IpAddr::V4(address)],
            prefixes: Vec::new(),
            capacity: Capacity::new(1),
            comment: String::new(),
        };
        Ok(reservation)
    }

    /// Creates a v6 reservation for a DUID or hardware address.
    pub fn v6(
        subnet_id: Uuid,
        client: ClientId,
        addresses: Vec<IpAddr>,
        prefixes: Vec<Ipv6Net>,
    ) -> Result<Self> {
        let (hw_address, duid) = match client {
            ClientId::HwAddress(hw) => (Some(normalize_hw_address(&hw)?), None),
            ClientId::Duid(duid) => (None, Some(normalize_duid(&duid)?)),
        };
        let capacity = Capacity::new((addresses.len() + prefixes.len()) as u128);
        let reservation = Self {
            id: Uuid::new_v4(),
            subnet_id,
            hw_address,
            duid,
            hostname: None,
            addresses,
            prefixes,
            capacity,
            comment: String::new(),
        };
        reservation.validate()?;
        Ok(reservation)
    }

    /// Number of bound addresses plus bound prefixes.
    pub fn bound_count(&self) -> Capacity {
        Capacity::new((self.addresses.len() + self.prefixes.len()) as u128)
    }

    pub fn client_key(&self) -> Option<&str> {
        self.duid.as_deref().or(self.hw_address.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hw_address.is_none() && self.duid.is_none() {
            return Err(Error::validation(
                "reservation needs a hardware address or a DUID",
            ));
        }
        if self.addresses.is_empty() && self.prefixes.is_empty() {
            return Err(Error::validation(
                "reservation needs at least one address or prefix",
            ));
        }

        match self.family() {
            Family::V4 => {
                if self.addresses.len() != 1 || !self.prefixes.is_empty() {
                    return Err(Error::validation(
                        "an IPv4 reservation binds exactly one address",
                    ));
                }
                if self.duid.is_some() {
                    return Err(Error::validation("DUIDs only apply to IPv6 reservations"));
                }
            }
            Family::V6 => {
                if let Some(addr) = self.addresses.iter().find(|addr| addr.is_ipv4()) {
                    return Err(Error::validation(format!(
                        "{} is not an IPv6 address",
                        addr
                    )));
                }
                if let Some(prefix) = self
                    .prefixes
                    .iter()
                    .find(|prefix| **prefix != prefix.trunc())
                {
                    return Err(Error::validation(format!(
                        "{} is not a network prefix",
                        prefix
                    )));
                }
            }
        }

        let ranges = self.ranges();
        for (index, first) in ranges.iter().enumerate() {
            if let Some(second) = ranges[index + 1..].iter().find(|other| first.overlaps(other)) {
                return Err(Error::validation(format!(
                    "reservation binds overlapping entries {} and {}",
                    first, second
                )));
            }
        }

        Ok(())
    }
}

impl AddressEntity for Reservation {
    fn kind(&self) -> EntityKind {
        EntityKind::Reservation
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Option<Uuid> {
        Some(self.subnet_id)
    }

    fn family(&self) -> Family {
        match self.addresses.first() {
            Some(addr) => Family::of(*addr),
            None => Family::V6,
        }
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    fn ranges(&self) -> Vec<AddressRange> {
        self.addresses
            .iter()
            .map(|addr| AddressRange::single(*addr))
            .chain(
                self.prefixes
                    .iter()
                    .map(|prefix| AddressRange::from_prefix(&IpNet::V6(*prefix))),
            )
            .collect()
    }
}

/// Client identifier of a v6 reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientId {
    HwAddress(String),
    Duid(String),
}

/// IPv6 prefix-delegation pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdPool {
    pub id: Uuid,
    pub subnet_id: Uuid,
    pub prefix: Ipv6Net,
    pub delegated_len: u8,
    pub capacity: Capacity,
    #[serde(default)]
    pub comment: String,
}

impl PdPool {
    pub fn new(subnet_id: Uuid, prefix: Ipv6Net, delegated_len: u8) -> Result<Self> {
        let capacity = delegation_capacity(&prefix, delegated_len)?;
        Ok(Self {
            id: Uuid::new_v4(),
            subnet_id,
            prefix,
            delegated_len,
            capacity,
            comment: String::new(),
        })
    }

    /// Last prefix this pool delegates.
    pub fn end_prefix(&self) -> Result<Ipv6Net> {
        let end = range::pd_end_prefix(
            self.prefix.network(),
            self.prefix.prefix_len(),
            self.delegated_len,
        )?;
        Ok(Ipv6Net::new(end, self.delegated_len)?)
    }
}

impl AddressEntity for PdPool {
    fn kind(&self) -> EntityKind {
        EntityKind::PdPool
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Option<Uuid> {
        Some(self.subnet_id)
    }

    fn family(&self) -> Family {
        Family::V6
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    fn ranges(&self) -> Vec<AddressRange> {
        vec![AddressRange::from_prefix(&IpNet::V6(self.prefix))]
    }
}

/// Excluded span inside a prefix-delegation pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedPdPool {
    pub id: Uuid,
    pub subnet_id: Uuid,
    pub prefix: Ipv6Net,
    pub delegated_len: u8,
    pub capacity: Capacity,
    #[serde(default)]
    pub comment: String,
}

impl ReservedPdPool {
    pub fn new(subnet_id: Uuid, prefix: Ipv6Net, delegated_len: u8) -> Result<Self> {
        let capacity = delegation_capacity(&prefix, delegated_len)?;
        Ok(Self {
            id: Uuid::new_v4(),
            subnet_id,
            prefix,
            delegated_len,
            capacity,
            comment: String::new(),
        })
    }
}

impl AddressEntity for ReservedPdPool {
    fn kind(&self) -> EntityKind {
        EntityKind::ReservedPdPool
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn parent_id(&self) -> Option<Uuid> {
        Some(self.subnet_id)
    }

    fn family(&self) -> Family {
        Family::V6
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    fn ranges(&self) -> Vec<AddressRange> {
        vec![AddressRange::from_prefix(&IpNet::V6(self.prefix))]
    }
}

fn delegation_capacity(prefix: &Ipv6Net, delegated_len: u8) -> Result<Capacity> {
    if *prefix != prefix.trunc() {
        return Err(Error::validation(format!(
            "{} is not a network prefix",
            prefix
        )));
    }
    range::pd_capacity(prefix.prefix_len(), delegated_len)
}

/// Reusable pool shape, applied relative to a subnet's network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTemplate {
    pub name: String,
    pub family: Family,
    pub begin_offset: u64,
    pub capacity: u64,
    #[serde(default)]
    pub domain_servers: Vec<IpAddr>,
    #[serde(default)]
    pub comment: String,
}

impl PoolTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("template name is required"));
        }
        if self.capacity == 0 {
            return Err(Error::validation(format!(
                "template {} must cover at least one address",
                self.name
            )));
        }
        Ok(())
    }

    /// Builds the pool this template describes inside `subnet`.
    pub fn instantiate(&self, subnet: &Subnet) -> Result<Pool> {
        if subnet.family() != self.family {
            return Err(Error::validation(format!(
                "template {} is {} but subnet {} is {}",
                self.name,
                self.family,
                subnet.prefix,
                subnet.family()
            )));
        }

        let begin = range::offset(subnet.prefix.network(), self.begin_offset as u128)?;
        self.validate()?;
        let end = range::offset(begin, u128::from(self.capacity) - 1)?;
        let mut pool = Pool::new(subnet.id, begin, end)?;
        pool.domain_servers = self.domain_servers.clone();
        pool.template = Some(self.name.clone());
        pool.comment = self.comment.clone();
        Ok(pool)
    }
}

/// Tagged union of every entity kind stored under a subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Subnet(Subnet),
    Pool(Pool),
    ReservedPool(ReservedPool),
    Reservation(Reservation),
    PdPool(PdPool),
    ReservedPdPool(ReservedPdPool),
}

impl Entity {
    fn inner(&self) -> &dyn AddressEntity {
        match self {
            Entity::Subnet(subnet) => subnet,
            Entity::Pool(pool) => pool,
            Entity::ReservedPool(pool) => pool,
            Entity::Reservation(reservation) => reservation,
            Entity::PdPool(pool) => pool,
            Entity::ReservedPdPool(pool) => pool,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn AddressEntity {
        match self {
            Entity::Subnet(subnet) => subnet,
            Entity::Pool(pool) => pool,
            Entity::ReservedPool(pool) => pool,
            Entity::Reservation(reservation) => reservation,
            Entity::PdPool(pool) => pool,
            Entity::ReservedPdPool(pool) => pool,
        }
    }
}

impl Entity {
    /// Checks the rules every stored entity satisfies: ordered same-family
    /// ranges, network-aligned prefixes and the per-kind field rules.
    pub fn validate(&self) -> Result<()> {
        match self {
            Entity::Subnet(subnet) => {
                if subnet.prefix != subnet.prefix.trunc() {
                    return Err(Error::validation(format!(
                        "{} is not a network address",
                        subnet.prefix
                    )));
                }
                subnet.validate()
            }
            Entity::Pool(Pool { begin, end, .. })
            | Entity::ReservedPool(ReservedPool { begin, end, .. }) => {
                range::size(*begin, *end).map(|_| ())
            }
            Entity::Reservation(reservation) => reservation.validate(),
            Entity::PdPool(PdPool {
                prefix,
                delegated_len,
                ..
            })
            | Entity::ReservedPdPool(ReservedPdPool {
                prefix,
                delegated_len,
                ..
            }) => delegation_capacity(prefix, *delegated_len).map(|_| ()),
        }
    }
}

impl AddressEntity for Entity {
    fn kind(&self) -> EntityKind {
        self.inner().kind()
    }

    fn id(&self) -> Uuid {
        self.inner().id()
    }

    fn parent_id(&self) -> Option<Uuid> {
        self.inner().parent_id()
    }

    fn family(&self) -> Family {
        self.inner().family()
    }

    fn capacity(&self) -> Capacity {
        self.inner().capacity()
    }

    fn set_capacity(&mut self, capacity: Capacity) {
        self.inner_mut().set_capacity(capacity);
    }

    fn ranges(&self) -> Vec<AddressRange> {
        self.inner().ranges()
    }
}

impl From<Subnet> for Entity {
    fn from(subnet: Subnet) -> Self {
        Entity::Subnet(subnet)
    }
}

impl From<Pool> for Entity {
    fn from(pool: Pool) -> Self {
        Entity::Pool(pool)
    }
}

impl From<ReservedPool> for Entity {
    fn from(pool: ReservedPool) -> Self {
        Entity::ReservedPool(pool)
    }
}

impl From<Reservation> for Entity {
    fn from(reservation: Reservation) -> Self {
        Entity::Reservation(reservation)
    }
}

impl From<PdPool> for Entity {
    fn from(pool: PdPool) -> Self {
        Entity::PdPool(pool)
    }
}

impl From<ReservedPdPool> for Entity {
    fn from(pool: ReservedPdPool) -> Self {
        Entity::ReservedPdPool(pool)
    }
}

macro_rules! entity_variant {
    ($($variant:ident),+) => {
        $(
            impl TryFrom<Entity> for $variant {
                type Error = Error;

                /// Fails with [`Error::NotFound`] for the expected kind when
                /// the entity is of another kind.
                fn try_from(entity: Entity) -> Result<Self> {
                    match entity {
                        Entity::$variant(inner) => Ok(inner),
                        other => Err(Error::not_found(EntityKind::$variant, other.id())),
                    }
                }
            }
        )+
    };
}

entity_variant!(Subnet, Pool, ReservedPool, Reservation, PdPool, ReservedPdPool);

/// Children of one subnet, grouped by kind and ordered by first address.
#[derive(Debug, Clone, Default)]
pub struct SubnetChildren {
    pub pools: Vec<Pool>,
    pub reserved_pools: Vec<ReservedPool>,
    pub reservations: Vec<Reservation>,
    pub pd_pools: Vec<PdPool>,
    pub reserved_pd_pools: Vec<ReservedPdPool>,
}

impl SubnetChildren {
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut children = SubnetChildren::default();
        for entity in entities {
            match entity {
                Entity::Subnet(_) => {}
                Entity::Pool(pool) => children.pools.push(pool),
                Entity::ReservedPool(pool) => children.reserved_pools.push(pool),
                Entity::Reservation(reservation) => children.reservations.push(reservation),
                Entity::PdPool(pool) => children.pd_pools.push(pool),
                Entity::ReservedPdPool(pool) => children.reserved_pd_pools.push(pool),
            }
        }

        children.pools.sort_by_key(|pool| range::to_u128(pool.begin));
        children.reserved_pools.sort_by_key(|pool| range::to_u128(pool.begin));
        children.reservations.sort_by_key(|reservation| {
            reservation
                .ranges()
                .first()
                .map(|r| range::to_u128(r.begin()))
        });
        children.pd_pools.sort_by_key(|pool| u128::from(pool.prefix.network()));
        children
            .reserved_pd_pools
            .sort_by_key(|pool| u128::from(pool.prefix.network()));
        children
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
            && self.reserved_pools.is_empty()
            && self.reservations.is_empty()
            && self.pd_pools.is_empty()
            && self.reserved_pd_pools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
            + self.reserved_pools.len()
            + self.reservations.len()
            + self.pd_pools.len()
            + self.reserved_pd_pools.len()
    }

    /// Drops the entity with `id`, used when an update is checked against
    /// its own siblings.
    pub fn without(mut self, id: Uuid) -> Self {
        self.pools.retain(|pool| pool.id != id);
        self.reserved_pools.retain(|pool| pool.id != id);
        self.reservations.retain(|reservation| reservation.id != id);
        self.pd_pools.retain(|pool| pool.id != id);
        self.reserved_pd_pools.retain(|pool| pool.id != id);
        self
    }
}

/// Normalizes a MAC address to lowercase colon-separated hex.
pub fn normalize_hw_address(hw_address: &str) -> Result<String> {
    let normalized = hw_address.trim().to_lowercase().replace('-', ":");
    let octets: Vec<&str> = normalized.split(':').collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|octet| octet.len() != 2 || u8::from_str_radix(octet, 16).is_err())
    {
        return Err(Error::validation(format!(
            "invalid hardware address '{}'",
            hw_address
        )));
    }
    Ok(octets.join(":"))
}

/// Normalizes a DUID to lowercase colon-separated hex.
pub fn normalize_duid(duid: &str) -> Result<String> {
    let hex: String = duid
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .collect::<String>()
        .to_lowercase();
    let invalid = || Error::validation(format!("invalid DUID '{}'", duid));
    if hex.is_empty()
        || hex.len() % 2 != 0
        || hex.len() / 2 > MAX_DUID_BYTES
        || !hex.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(invalid());
    }

    let bytes: Vec<&str> = hex
        .as_bytes()
        .chunks(2)
        .map(std::str::from_utf8)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;
    Ok(bytes.join(":"))
}
