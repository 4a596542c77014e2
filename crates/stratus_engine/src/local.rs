//! Local persistence adapter and entity mapping.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use stratus_protocol::{FieldValue, Partition, Record, RecordConvertible, RecordId};

/// Identifier of an entity in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Local representation of a synchronized object.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntity {
    /// Local identifier, assigned on insert.
    pub local_id: LocalId,
    /// Entity type name.
    pub entity_type: String,
    /// Linked remote record, once known.
    pub remote_id: Option<RecordId>,
    /// Scalar attributes.
    pub fields: BTreeMap<String, FieldValue>,
    /// To-one relationships by field name.
    pub relationships: BTreeMap<String, LocalId>,
    /// Fields changed locally since the last upload.
    pub dirty: BTreeSet<String>,
    /// Time of the last local modification.
    pub modified_at: Option<DateTime<Utc>>,
    /// Server change tag of the last known remote version.
    pub change_tag: Option<String>,
    /// Deleted locally; waiting for the remote delete.
    pub pending_deletion: bool,
}

impl LocalEntity {
    /// Creates an empty, clean entity.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            local_id: LocalId(0),
            entity_type: entity_type.into(),
            remote_id: None,
            fields: BTreeMap::new(),
            relationships: BTreeMap::new(),
            dirty: BTreeSet::new(),
            modified_at: None,
            change_tag: None,
            pending_deletion: false,
        }
    }

    /// Returns true if any field changed locally.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Sets a field as a local edit: marks it dirty and stamps the time.
    pub fn edit(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        self.fields.insert(name.clone(), value.into());
        self.dirty.insert(name);
        self.modified_at = Some(Utc::now());
    }

    /// Sets a relationship as a local edit.
    pub fn relate(&mut self, name: impl Into<String>, target: LocalId) {
        let name = name.into();
        self.relationships.insert(name.clone(), target);
        self.dirty.insert(name);
        self.modified_at = Some(Utc::now());
    }

    /// Modification time of unsent local changes.
    ///
    /// A clean entity has nothing to defend against a remote version.
    pub fn unsent_change_time(&self) -> Option<DateTime<Utc>> {
        if self.is_dirty() {
            self.modified_at
        } else {
            None
        }
    }
}

/// Mapping between a record type and a local entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    /// Remote type tag.
    pub record_type: String,
    /// Local entity type name.
    pub entity_type: String,
    /// Partition new records are created in.
    pub partition: Partition,
    /// Fields that sync; `None` syncs every field.
    pub synced_fields: Option<BTreeSet<String>>,
}

impl EntityInfo {
    /// Creates a mapping that syncs every field.
    pub fn new(
        record_type: impl Into<String>,
        entity_type: impl Into<String>,
        partition: Partition,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            entity_type: entity_type.into(),
            partition,
            synced_fields: None,
        }
    }

    /// Creates a mapping for a convertible type; the entity type shares its tag.
    pub fn of<T: RecordConvertible>(partition: Partition) -> Self {
        Self::new(T::RECORD_TYPE, T::RECORD_TYPE, partition)
    }

    /// Restricts syncing to the named fields.
    pub fn with_synced_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synced_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if the field syncs.
    pub fn syncs(&self, field: &str) -> bool {
        self.synced_fields
            .as_ref()
            .map_or(true, |fields| fields.contains(field))
    }

    /// Applies a remote snapshot to an entity.
    ///
    /// Synced scalar fields are overwritten and their dirty flags cleared.
    /// Reference fields only lose their dirty flag; linking them is the
    /// reference connector's job. Fields absent from the snapshot keep
    /// their local value.
    pub fn load(&self, entity: &mut LocalEntity, record: &Record) {
        for (name, value) in &record.fields {
            if !self.syncs(name) {
                continue;
            }
            if value.as_reference().is_none() {
                entity.fields.insert(name.clone(), value.clone());
            }
            entity.dirty.remove(name);
        }
        entity.remote_id = Some(record.id.clone());
        entity.change_tag = record.change_tag.clone();
    }

    /// Builds the record for an entity.
    ///
    /// `references` holds the remote identifiers of related entities.
    pub fn to_record(
        &self,
        entity: &LocalEntity,
        id: RecordId,
        references: &BTreeMap<String, RecordId>,
    ) -> Record {
        let mut record = Record::new(id, self.record_type.clone());
        for (name, value) in &entity.fields {
            if self.syncs(name) {
                record.set(name.clone(), value.clone());
            }
        }
        for (name, target) in references {
            if self.syncs(name) {
                record.set(name.clone(), FieldValue::Reference(target.clone()));
            }
        }
        record.modified_at = entity.modified_at;
        record.change_tag = entity.change_tag.clone();
        record
    }
}

/// Registered entity mappings, kept in upload order.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entries: Vec<EntityInfo>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping, builder style.
    pub fn with(mut self, info: EntityInfo) -> Self {
        self.register(info);
        self
    }

    /// Adds a mapping, replacing any mapping for the same record type.
    pub fn register(&mut self, info: EntityInfo) {
        self.entries.retain(|e| e.record_type != info.record_type);
        self.entries.push(info);
    }

    /// Adds the mapping of a convertible type.
    pub fn register_type<T: RecordConvertible>(&mut self, partition: Partition) {
        self.register(EntityInfo::of::<T>(partition));
    }

    /// Looks up a mapping by record type.
    pub fn by_record_type(&self, record_type: &str) -> Option<&EntityInfo> {
        self.entries.iter().find(|e| e.record_type == record_type)
    }

    /// Looks up a mapping by entity type.
    pub fn by_entity_type(&self, entity_type: &str) -> Option<&EntityInfo> {
        self.entries.iter().find(|e| e.entity_type == entity_type)
    }

    /// Iterates over mappings in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entries.iter()
    }

    /// Returns the number of mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Operations available inside a local transaction.
pub trait EntityTxn {
    /// Reads an entity.
    fn get(&self, id: LocalId) -> Option<LocalEntity>;

    /// Finds the entity linked to a remote record.
    fn find_by_remote_id(&self, id: &RecordId) -> Option<LocalEntity>;

    /// Inserts an entity and returns its new identifier.
    fn insert(&mut self, entity: LocalEntity) -> LocalId;

    /// Replaces an existing entity.
    fn update(&mut self, entity: LocalEntity) -> SyncResult<()>;

    /// Deletes an entity, returning true if it existed.
    fn delete(&mut self, id: LocalId) -> bool;

    /// Returns the entities of a type with a nonempty dirty set.
    fn dirty_entities(&self, entity_type: &str) -> Vec<LocalEntity>;
}

/// The local persistence engine.
///
/// Mutation happens inside [`LocalStore::transaction`], a scoped and
/// serialized unit of work.
pub trait LocalStore: Send + Sync + 'static {
    /// Runs `f` in a transaction.
    ///
    /// Changes are committed only if `f` returns `Ok`.
    fn transaction<R, F>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut dyn EntityTxn) -> SyncResult<R>;

    /// Saves committed changes durably.
    fn flush(&self) -> SyncResult<()>;
}

#[derive(Debug, Clone, Default)]
struct Entities {
    rows: BTreeMap<LocalId, LocalEntity>,
    next_id: u64,
}

impl EntityTxn for Entities {
    fn get(&self, id: LocalId) -> Option<LocalEntity> {
        self.rows.get(&id).cloned()
    }

    fn find_by_remote_id(&self, id: &RecordId) -> Option<LocalEntity> {
        self.rows
            .values()
            .find(|e| e.remote_id.as_ref() == Some(id))
            .cloned()
    }

    fn insert(&mut self, mut entity: LocalEntity) -> LocalId {
        self.next_id += 1;
        let id = LocalId(self.next_id);
        entity.local_id = id;
        self.rows.insert(id, entity);
        id
    }

    fn update(&mut self, entity: LocalEntity) -> SyncResult<()> {
        match self.rows.get_mut(&entity.local_id) {
            Some(row) => {
                *row = entity;
                Ok(())
            }
            None => Err(SyncError::LocalStore(format!(
                "no entity {}",
                entity.local_id
            ))),
        }
    }

    fn delete(&mut self, id: LocalId) -> bool {
        self.rows.remove(&id).is_some()
    }

    fn dirty_entities(&self, entity_type: &str) -> Vec<LocalEntity> {
        self.rows
            .values()
            .filter(|e| e.entity_type == entity_type && e.is_dirty())
            .cloned()
            .collect()
    }
}

/// An in-memory local store for testing.
///
/// Transactions run on a copy of the data that replaces the original only
/// on success.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: Mutex<Entities>,
    flushes: AtomicUsize,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entity as application code would: every field is dirty.
    pub fn create<I, S, V>(&self, entity_type: &str, fields: I) -> LocalId
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<FieldValue>,
    {
        let mut entity = LocalEntity::new(entity_type);
        for (name, value) in fields {
            entity.edit(name, value);
        }
        self.entities.lock().insert(entity)
    }

    /// Edits a field as application code would.
    pub fn edit(
        &self,
        id: LocalId,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> SyncResult<()> {
        self.modify(id, |entity| entity.edit(name, value))
    }

    /// Relates two entities as application code would.
    pub fn relate(&self, id: LocalId, name: impl Into<String>, target: LocalId) -> SyncResult<()> {
        self.modify(id, |entity| entity.relate(name, target))
    }

    fn modify(&self, id: LocalId, f: impl FnOnce(&mut LocalEntity)) -> SyncResult<()> {
        let mut entities = self.entities.lock();
        let mut entity = entities
            .get(id)
            .ok_or_else(|| SyncError::LocalStore(format!("no entity {id}")))?;
        f(&mut entity);
        entities.update(entity)
    }

    /// Reads an entity.
    pub fn get(&self, id: LocalId) -> Option<LocalEntity> {
        self.entities.lock().get(id)
    }

    /// Finds the entity linked to a remote record.
    pub fn find(&self, id: &RecordId) -> Option<LocalEntity> {
        self.entities.lock().find_by_remote_id(id)
    }

    /// Returns every entity of a type.
    pub fn all(&self, entity_type: &str) -> Vec<LocalEntity> {
        self.entities
            .lock()
            .rows
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect()
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.entities.lock().rows.len()
    }

    /// Returns true if the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many times the store was flushed.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl LocalStore for MemoryLocalStore {
    fn transaction<R, F>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut dyn EntityTxn) -> SyncResult<R>,
    {
        let mut entities = self.entities.lock();
        let mut working = entities.clone();
        let result = f(&mut working)?;
        *entities = working;
        Ok(result)
    }

    fn flush(&self) -> SyncResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
