//! Transactional storage boundary.
//!
//! The engine only needs a small set of operations keyed by subnet: fetch
//! all children of a subnet, insert, update (whole entity or capacity only),
//! delete by id and count by predicate. [`Store`] hands out a
//! [`Transaction`] that is isolated from concurrent mutations until it is
//! committed or dropped. Dropping an uncommitted transaction discards it.
//!
//! [`MemoryStore`] is the reference implementation: the whole state sits
//! behind a single [`Mutex`], every transaction works on a private copy and
//! commit swaps the copy in, optionally persisting it as JSON.
//!
//! # Thread Safety
//!
//! Holding a [`MemoryStore`] transaction serializes every other mutation,
//! including registry and agent calls made while it is open.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AddressEntity, Entity, PoolTemplate, Subnet, SubnetChildren};
use crate::propagation::{PropagationRecord, RecordState};
use crate::range::Capacity;

/// Predicate used by [`Transaction::count`].
pub type EntityFilter<'a> = &'a (dyn Fn(&Entity) -> bool + Send + Sync);

/// Source of transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// An open, isolated unit of work.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, id: Uuid) -> Result<Option<Entity>>;

    async fn subnets(&mut self) -> Result<Vec<Subnet>>;

    /// Every child of `subnet_id`, grouped by kind.
    async fn children(&mut self, subnet_id: Uuid) -> Result<SubnetChildren>;

    /// # Errors
    ///
    /// Fails if an entity with the same id already exists.
    async fn insert(&mut self, entity: Entity) -> Result<()>;

    /// Replaces the stored entity with the same id and kind.
    async fn update(&mut self, entity: Entity) -> Result<()>;

    async fn update_capacity(&mut self, id: Uuid, capacity: Capacity) -> Result<()>;

    /// Removes and returns the entity.
    async fn delete(&mut self, id: Uuid) -> Result<Entity>;

    async fn count(&mut self, filter: EntityFilter<'_>) -> Result<usize>;

    async fn exists(&mut self, filter: EntityFilter<'_>) -> Result<bool> {
        Ok(self.count(filter).await? > 0)
    }

    async fn templates(&mut self) -> Result<Vec<PoolTemplate>>;

    async fn template(&mut self, name: &str) -> Result<Option<PoolTemplate>>;

    /// Inserts or replaces a template by name.
    async fn put_template(&mut self, template: PoolTemplate) -> Result<()>;

    /// Returns false if no template had that name.
    async fn delete_template(&mut self, name: &str) -> Result<bool>;

    async fn record_propagation(&mut self, record: PropagationRecord) -> Result<()>;

    async fn propagation_records(&mut self) -> Result<Vec<PropagationRecord>>;

    /// Marks a saga record as repaired by an external reconciler.
    async fn resolve_propagation(&mut self, id: Uuid) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Persistent store format (serialized to JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    /// Subnets and their children indexed by id.
    #[serde(default)]
    pub entities: BTreeMap<Uuid, Entity>,
    #[serde(default)]
    pub templates: BTreeMap<String, PoolTemplate>,
    /// Saga intent log of partially propagated mutations.
    #[serde(default)]
    pub propagation_records: Vec<PropagationRecord>,
}

/// In-memory store with optional JSON persistence.
///
/// # Example
///
/// ```no_run
/// use dhcpscope::store::{MemoryStore, Store};
///
/// # async fn example() -> dhcpscope::Result<()> {
/// let store = MemoryStore::open("store.json").await?;
/// let mut tx = store.begin().await?;
/// let subnets = tx.subnets().await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreData>>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreData {
    /// Rejects entities and templates that could not have been created
    /// through the engine, such as reversed ranges or unaligned prefixes.
    pub fn validate(&self) -> Result<()> {
        for (id, entity) in &self.entities {
            if *id != entity.id() {
                return Err(Error::validation(format!(
                    "{} is stored under id {}",
                    entity.entity_ref(),
                    id
                )));
            }
            entity.validate()?;
        }
        for template in self.templates.values() {
            template.validate()?;
        }
        Ok(())
    }
}

impl MemoryStore {
    /// Creates a store that lives only in memory.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreData::default())),
            path: None,
        }
    }

    /// Opens a store persisted at `path`, loading it if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = Self::load_data(path).await?;
        debug!(
            "Loaded {} entities from {}",
            data.entities.len(),
            path.display()
        );
        Ok(Self {
            state: Arc::new(Mutex::new(data)),
            path: Some(path.to_path_buf()),
        })
    }

    async fn load_data(path: &Path) -> Result<StoreData> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let data: StoreData = serde_json::from_str(&content)?;
            data.validate()
                .map_err(|e| Error::Infrastructure(format!("{}: {}", path.display(), e)))?;
            Ok(data)
        } else {
            Ok(StoreData::default())
        }
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> StoreData {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            path: self.path.clone(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<StoreData>,
    working: StoreData,
    path: Option<PathBuf>,
}

impl MemoryTransaction {
    fn entity_mut(&mut self, id: Uuid) -> Result<&mut Entity> {
        self.working
            .entities
            .get_mut(&id)
            .ok_or_else(|| Error::Infrastructure(format!("entity {} is not stored", id)))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.working.entities.get(&id).cloned())
    }

    async fn subnets(&mut self) -> Result<Vec<Subnet>> {
        let mut subnets: Vec<Subnet> = self
            .working
            .entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Subnet(subnet) => Some(subnet.clone()),
                _ => None,
            })
            .collect();
        subnets.sort_by(|a, b| {
            (a.prefix.addr(), a.prefix.prefix_len()).cmp(&(b.prefix.addr(), b.prefix.prefix_len()))
        });
        Ok(subnets)
    }

    async fn children(&mut self, subnet_id: Uuid) -> Result<SubnetChildren> {
        Ok(SubnetChildren::from_entities(
            self.working
                .entities
                .values()
                .filter(|entity| entity.parent_id() == Some(subnet_id))
                .cloned(),
        ))
    }

    async fn insert(&mut self, entity: Entity) -> Result<()> {
        let id = entity.id();
        if self.working.entities.contains_key(&id) {
            return Err(Error::Infrastructure(format!(
                "{} {} already stored",
                entity.kind(),
                id
            )));
        }
        self.working.entities.insert(id, entity);
        Ok(())
    }

    async fn update(&mut self, entity: Entity) -> Result<()> {
        let stored = self
            .working
            .entities
            .get_mut(&entity.id())
            .ok_or_else(|| Error::not_found(entity.kind(), entity.id()))?;
        if stored.kind() != entity.kind() {
            return Err(Error::validation(format!(
                "cannot replace {} {} with a {}",
                stored.kind(),
                stored.id(),
                entity.kind()
            )));
        }
        *stored = entity;
        Ok(())
    }

    async fn update_capacity(&mut self, id: Uuid, capacity: Capacity) -> Result<()> {
        self.entity_mut(id)?.set_capacity(capacity);
        Ok(())
    }

    async fn delete(&mut self, id: Uuid) -> Result<Entity> {
        self.working
            .entities
            .remove(&id)
            .ok_or_else(|| Error::Infrastructure(format!("entity {} is not stored", id)))
    }

    async fn count(&mut self, filter: EntityFilter<'_>) -> Result<usize> {
        Ok(self
            .working
            .entities
            .values()
            .filter(|entity| filter(entity))
            .count())
    }

    async fn templates(&mut self) -> Result<Vec<PoolTemplate>> {
        Ok(self.working.templates.values().cloned().collect())
    }

    async fn template(&mut self, name: &str) -> Result<Option<PoolTemplate>> {
        Ok(self.working.templates.get(name).cloned())
    }

    async fn put_template(&mut self, template: PoolTemplate) -> Result<()> {
        self.working
            .templates
            .insert(template.name.clone(), template);
        Ok(())
    }

    async fn delete_template(&mut self, name: &str) -> Result<bool> {
        Ok(self.working.templates.remove(name).is_some())
    }

    async fn record_propagation(&mut self, record: PropagationRecord) -> Result<()> {
        self.working.propagation_records.push(record);
        Ok(())
    }

    async fn propagation_records(&mut self) -> Result<Vec<PropagationRecord>> {
        Ok(self.working.propagation_records.clone())
    }

    async fn resolve_propagation(&mut self, id: Uuid) -> Result<()> {
        let record = self
            .working
            .propagation_records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| Error::Infrastructure(format!("propagation record {} not found", id)))?;
        record.state = RecordState::Resolved;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            mut guard,
            working,
            path,
        } = *self;

        if let Some(path) = path {
            let content = serde_json::to_string_pretty(&working)?;
            tokio::fs::write(&path, content).await?;
        }

        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, Lifetimes, Pool};

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn subnet() -> Subnet {
        Subnet::new("10.0.0.0/24".parse().unwrap(), Lifetimes::default()).unwrap()
    }

    fn pool_in(subnet: &Subnet) -> Pool {
        Pool::new(subnet.id, "10.0.0.10".parse().unwrap(), "10.0.0.20".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_commit_makes_changes_visible() {
        let store = MemoryStore::new();
        let subnet = subnet();

        let mut tx = store.begin().await.unwrap();
        tx.insert(Entity::from(subnet.clone())).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.subnets().await.unwrap(), vec![subnet]);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(Entity::from(subnet())).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.subnets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_children_and_capacity_updates() {
        let store = MemoryStore::new();
        let subnet = subnet();
        let pool = pool_in(&subnet);

        let mut tx = store.begin().await.unwrap();
        tx.insert(Entity::from(subnet.clone())).await.unwrap();
        tx.insert(Entity::from(pool.clone())).await.unwrap();
        tx.update_capacity(pool.id, Capacity::new(7)).await.unwrap();

        let children = tx.children(subnet.id).await.unwrap();
        assert_eq!(children.pools.len(), 1);
        assert_eq!(children.pools[0].capacity, Capacity::new(7));
        assert!(tx.exists(&|entity| entity.kind() == EntityKind::Pool).await.unwrap());

        assert!(tx.insert(Entity::from(pool.clone())).await.is_err());
        tx.delete(pool.id).await.unwrap();
        assert!(tx.delete(pool.id).await.is_err());
        assert_eq!(tx.count(&|entity| entity.parent_id() == Some(subnet.id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_refuses_kind_change() {
        let store = MemoryStore::new();
        let subnet = subnet();
        let mut tx = store.begin().await.unwrap();
        tx.insert(Entity::from(subnet.clone())).await.unwrap();

        let mut pool = pool_in(&subnet);
        pool.id = subnet.id;
        assert!(tx.update(Entity::from(pool)).await.is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_reversed_range() {
        let path = "test_store_reversed.json".to_string();
        let _guard = TestGuard(path.clone());
        let subnet = subnet();
        let mut pool = pool_in(&subnet);
        std::mem::swap(&mut pool.begin, &mut pool.end);

        let mut data = StoreData::default();
        data.entities.insert(subnet.id, Entity::from(subnet));
        data.entities.insert(pool.id, Entity::from(pool));
        std::fs::write(&path, serde_json::to_string(&data).unwrap()).unwrap();

        assert!(matches!(
            MemoryStore::open(&path).await,
            Err(Error::Infrastructure(_))
        ));
    }

    #[tokio::test]
    async fn test_store_persistence() {
        let path = "test_store_persist.json".to_string();
        let _guard = TestGuard(path.clone());
        let subnet = subnet();

        {
            let store = MemoryStore::open(&path).await.unwrap();
            let mut tx = store.begin().await.unwrap();
            tx.insert(Entity::from(subnet.clone())).await.unwrap();
            tx.put_template(PoolTemplate {
                name: "office".to_string(),
                family: crate::range::Family::V4,
                begin_offset: 10,
                capacity: 20,
                domain_servers: vec![],
                comment: String::new(),
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        {
            let store = MemoryStore::open(&path).await.unwrap();
            let mut tx = store.begin().await.unwrap();
            assert_eq!(tx.subnets().await.unwrap(), vec![subnet]);
            assert!(tx.template("office").await.unwrap().is_some());
        }
    }
}
