//! Entities and their lifecycle.
//!
//! An [`EntityRef`] is a shared handle to one record of one role. Entities
//! build their own commands: `queue_store` produces an insert for a NEW
//! entity and an update of the changed fields for a loaded one, and the
//! relations wrap that command with their own. Reactions on the command
//! move the entity through its lifecycle:
//!
//! ```text
//! NEW -> SCHEDULED_INSERT -> LOADED -> SCHEDULED_UPDATE -> LOADED
//!                              |
//!                              +-> SCHEDULED_DELETE -> DELETED
//! ```
//!
//! A rollback returns the entity to the state it had before the attempt.
//!
//! The record lock is never held while another entity is locked or while
//! relations queue their commands.

use crate::command::{Bind, Command, CommandKind, ContextSlot, TableCommand};
use crate::relation::{self, Criteria, PivotData, Relation};
use crate::schema::EntitySchema;
use relmap_core::{Error, FromValue, Result, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not persisted yet.
    New,
    /// Insert queued, not yet committed.
    ScheduledInsert,
    /// In sync with storage.
    Loaded,
    /// Update queued, not yet committed.
    ScheduledUpdate,
    /// Delete queued, not yet committed.
    ScheduledDelete,
    /// Removed from storage.
    Deleted,
}

impl EntityState {
    /// Whether the entity has (or is about to have) a row to address.
    pub const fn is_loaded(self) -> bool {
        !matches!(
            self,
            EntityState::New | EntityState::Deleted | EntityState::ScheduledDelete
        )
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    (a.is_null() && b.is_null()) || a.loosely_eq(b)
}

pub(crate) struct Record {
    fields: Vec<Value>,
    changes: BTreeSet<usize>,
    state: EntityState,
    solid: bool,
    relations: Vec<Relation>,
    last_insert: Option<ContextSlot>,
}

struct EntityCell {
    schema: Arc<EntitySchema>,
    record: RwLock<Record>,
}

/// How a store is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreMode {
    pub with_relations: bool,
    /// Produce a command able to carry context even without changes.
    pub force_context: bool,
}

impl StoreMode {
    pub(crate) const fn new(with_relations: bool) -> Self {
        Self {
            with_relations,
            force_context: false,
        }
    }

    pub(crate) const fn contextual(with_relations: bool) -> Self {
        Self {
            with_relations,
            force_context: true,
        }
    }
}

/// Entities already queued while building one command tree.
#[derive(Default)]
pub(crate) struct QueueScope {
    visited: Vec<EntityRef>,
}

impl QueueScope {
    fn enter(&mut self, entity: &EntityRef) -> bool {
        if self.visited.iter().any(|e| e.ptr_eq(entity)) {
            return false;
        }
        self.visited.push(entity.clone());
        true
    }
}

/// Shared handle to one entity.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("EntityRef");
        out.field("role", &self.role());
        match self.0.record.try_read() {
            Ok(record) => {
                out.field("state", &record.state);
                out.field("fields", &record.fields);
            }
            Err(_) => {
                out.field("state", &"<locked>");
            }
        }
        out.finish()
    }
}

impl EntityRef {
    fn from_record(schema: Arc<EntitySchema>, fields: Vec<Value>, state: EntityState) -> Self {
        let relations = schema
            .relations()
            .iter()
            .map(|(name, relation)| Relation::from_schema(name, relation))
            .collect();
        let solid = schema.persist_all_fields();
        Self(Arc::new(EntityCell {
            record: RwLock::new(Record {
                fields,
                changes: BTreeSet::new(),
                state,
                solid,
                relations,
                last_insert: None,
            }),
            schema,
        }))
    }

    /// A NEW entity holding the schema defaults.
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        let fields = schema
            .columns()
            .iter()
            .map(|c| schema.default_for(c))
            .collect();
        Self::from_record(schema, fields, EntityState::New)
    }

    /// An entity built from fetched data; missing columns are NULL.
    ///
    /// The entity is LOADED only when every primary key column carries a
    /// value. Without one there is no row to update or delete, so it starts
    /// NEW and a later store inserts it.
    pub fn loaded(schema: Arc<EntitySchema>, values: &[(String, Value)]) -> Self {
        let fields: Vec<Value> = schema
            .columns()
            .iter()
            .map(|c| {
                values
                    .iter()
                    .find(|(name, _)| name == c)
                    .map_or(Value::Null, |(_, v)| v.clone())
            })
            .collect();
        let keyed = schema.primary_key().iter().all(|pk| {
            schema
                .column_index(pk)
                .is_some_and(|i| !fields[i].is_null())
        });
        let state = if keyed {
            EntityState::Loaded
        } else {
            EntityState::New
        };
        Self::from_record(schema, fields, state)
    }

    fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.0.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.0.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.0.schema
    }

    pub fn role(&self) -> &str {
        self.0.schema.role()
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn state(&self) -> EntityState {
        self.read().state
    }

    /// Current value of `field`, `None` if the role has no such column.
    pub fn get(&self, field: &str) -> Option<Value> {
        let index = self.0.schema.column_index(field)?;
        self.read().fields.get(index).cloned()
    }

    /// Typed read of `field`.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<T> {
        let value = self
            .get(field)
            .ok_or_else(|| Error::record(self.role(), format!("unknown field '{}'", field)))?;
        T::from_value(&value)
    }

    /// Assign `field`, tracking the change when the value differs.
    #[allow(clippy::result_large_err)]
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let index = self
            .0
            .schema
            .column_index(field)
            .ok_or_else(|| Error::record(self.role(), format!("unknown field '{}'", field)))?;
        let value = value.into();
        let mut record = self.write();
        if !same_value(&record.fields[index], &value) {
            record.fields[index] = value;
            record.changes.insert(index);
        }
        Ok(())
    }

    /// All fields in column order.
    pub fn fields(&self) -> Vec<(String, Value)> {
        let record = self.read();
        self.0
            .schema
            .columns()
            .iter()
            .cloned()
            .zip(record.fields.iter().cloned())
            .collect()
    }

    /// Names of the fields changed since the last store was queued.
    pub fn changes(&self) -> Vec<String> {
        let record = self.read();
        let columns = self.0.schema.columns();
        record.changes.iter().map(|&i| columns[i].clone()).collect()
    }

    pub fn is_changed(&self) -> bool {
        !self.read().changes.is_empty()
    }

    /// Write every field on update instead of only the changed ones.
    pub fn set_persist_all(&self, enabled: bool) {
        self.write().solid = enabled;
    }

    /// Primary key value of a single-column key, `None` while absent.
    pub fn primary_key(&self) -> Option<Value> {
        let pk = self.0.schema.single_primary_key()?;
        self.get(pk).filter(|v| !v.is_null())
    }

    /// Values of all primary key columns, in key order.
    pub fn primary_key_values(&self) -> Vec<Value> {
        let record = self.read();
        self.0
            .schema
            .primary_key()
            .iter()
            .map(|pk| {
                self.0
                    .schema
                    .column_index(pk)
                    .map_or(Value::Null, |i| record.fields[i].clone())
            })
            .collect()
    }

    /// Bind for `column`: its current value, or the pending insert id when
    /// the column is the still-absent primary key.
    pub(crate) fn key_bind(&self, column: &str) -> Bind {
        let record = self.read();
        let value = self
            .0
            .schema
            .column_index(column)
            .map_or(Value::Null, |i| record.fields[i].clone());
        if value.is_null() && self.0.schema.single_primary_key() == Some(column) {
            if let Some(slot) = &record.last_insert {
                return Bind::Slot(slot.clone());
            }
        }
        Bind::Value(value)
    }

    /// Check whether `column` already holds what `bind` would write.
    pub(crate) fn holds(&self, column: &str, bind: &Bind) -> bool {
        match bind.resolve() {
            Some(value) if !bind.is_deferred() => self
                .get(column)
                .is_some_and(|current| same_value(&current, &value)),
            _ => false,
        }
    }

    // Relations ---------------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn relation_index(&self, name: &str) -> Result<usize> {
        self.0.schema.relation_index(name).ok_or_else(|| {
            Error::record(self.role(), format!("unknown relation '{}'", name))
        })
    }

    /// Run `f` on the relation at `index` under the record lock.
    pub(crate) fn relation_at<R>(&self, index: usize, f: impl FnOnce(&mut Relation) -> R) -> R {
        let mut record = self.write();
        f(&mut record.relations[index])
    }

    /// Run `f` on the named relation under the record lock.
    ///
    /// `f` must not lock other entities; relation operations only compare
    /// identities and roles.
    #[allow(clippy::result_large_err)]
    pub fn with_relation<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Relation) -> Result<R>,
    ) -> Result<R> {
        let index = self.relation_index(name)?;
        self.relation_at(index, f)
    }

    #[allow(clippy::result_large_err)]
    pub fn is_relation_loaded(&self, name: &str) -> Result<bool> {
        self.with_relation(name, |r| Ok(r.is_loaded()))
    }

    /// Related entity of a single-valued relation.
    #[allow(clippy::result_large_err)]
    pub fn related(&self, name: &str) -> Result<Option<EntityRef>> {
        self.with_relation(name, |r| r.get())
    }

    /// Assign the related entity of a single-valued relation.
    #[allow(clippy::result_large_err)]
    pub fn set_related(&self, name: &str, entity: Option<EntityRef>) -> Result<()> {
        self.with_relation(name, |r| r.set(entity))
    }

    /// Current members of a relation (has-many instances, linked entities).
    #[allow(clippy::result_large_err)]
    pub fn related_many(&self, name: &str) -> Result<Vec<EntityRef>> {
        self.with_relation(name, |r| Ok(r.instances()))
    }

    /// Attach `entity` to a has-many relation.
    #[allow(clippy::result_large_err)]
    pub fn add(&self, name: &str, entity: EntityRef) -> Result<()> {
        self.with_relation(name, |r| r.add(entity))
    }

    /// Detach `entity` from a has-many relation.
    #[allow(clippy::result_large_err)]
    pub fn remove(&self, name: &str, entity: &EntityRef) -> Result<()> {
        self.with_relation(name, |r| r.delete(entity))
    }

    /// Link `entity` through a many-to-many relation.
    #[allow(clippy::result_large_err)]
    pub fn link(&self, name: &str, entity: EntityRef, pivot: PivotData) -> Result<()> {
        self.with_relation(name, |r| r.link(entity, pivot))
    }

    #[allow(clippy::result_large_err)]
    pub fn unlink(&self, name: &str, entity: &EntityRef) -> Result<()> {
        self.with_relation(name, |r| r.unlink(entity))
    }

    /// Link exactly `entities`, unlinking everything else.
    #[allow(clippy::result_large_err)]
    pub fn sync(&self, name: &str, entities: Vec<EntityRef>) -> Result<()> {
        self.with_relation(name, |r| r.sync(entities))
    }

    #[allow(clippy::result_large_err)]
    pub fn get_pivot(&self, name: &str, entity: &EntityRef) -> Result<PivotData> {
        self.with_relation(name, |r| r.get_pivot(entity))
    }

    /// Check whether any member of the relation matches `criteria`.
    #[allow(clippy::result_large_err)]
    pub fn has(&self, name: &str, criteria: &Criteria) -> Result<bool> {
        Ok(self.match_one(name, criteria)?.is_some())
    }

    /// First member matching `criteria`.
    #[allow(clippy::result_large_err)]
    pub fn match_one(&self, name: &str, criteria: &Criteria) -> Result<Option<EntityRef>> {
        let members = self.related_many(name)?;
        Ok(members.into_iter().find(|e| criteria.matches(e)))
    }

    /// Every member matching `criteria`.
    #[allow(clippy::result_large_err)]
    pub fn match_multiple(&self, name: &str, criteria: &Criteria) -> Result<Vec<EntityRef>> {
        let members = self.related_many(name)?;
        Ok(members.into_iter().filter(|e| criteria.matches(e)).collect())
    }

    // Commands ----------------------------------------------------------

    /// Produce the command persisting this entity.
    ///
    /// With `with_relations` every relation wraps the command with its own
    /// before/after commands.
    #[allow(clippy::result_large_err)]
    pub fn queue_store(&self, with_relations: bool) -> Result<Command> {
        let mut scope = QueueScope::default();
        self.queue_store_scoped(StoreMode::new(with_relations), &mut scope)
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn queue_store_scoped(
        &self,
        mode: StoreMode,
        scope: &mut QueueScope,
    ) -> Result<Command> {
        if !scope.enter(self) {
            return Ok(Command::noop(self.0.schema.table()));
        }
        let force_context =
            mode.force_context || (mode.with_relations && relation::needs_context(self));
        let mut command = self.plan_store(force_context)?;
        if mode.with_relations {
            if let Err(e) = relation::queue_relations(self, &mut command, scope) {
                command.discard();
                return Err(e);
            }
        }
        Ok(command)
    }

    /// Primary key predicate; a still-absent key binds to the pending insert.
    #[allow(clippy::result_large_err)]
    fn pk_predicate(&self, record: &Record) -> Result<Vec<(String, Bind)>> {
        let schema = &self.0.schema;
        if schema.primary_key().is_empty() {
            return Err(Error::record(self.role(), "role has no primary key"));
        }
        schema
            .primary_key()
            .iter()
            .map(|pk| {
                let value = schema
                    .column_index(pk)
                    .map_or(Value::Null, |i| record.fields[i].clone());
                if !value.is_null() {
                    return Ok((pk.clone(), Bind::Value(value)));
                }
                match (&record.last_insert, schema.single_primary_key()) {
                    (Some(slot), Some(single)) if single == pk => {
                        Ok((pk.clone(), Bind::Slot(slot.clone())))
                    }
                    _ => Err(Error::record(
                        self.role(),
                        format!("primary key '{}' is not set", pk),
                    )),
                }
            })
            .collect()
    }

    #[allow(clippy::result_large_err)]
    fn plan_store(&self, force_context: bool) -> Result<Command> {
        let schema = Arc::clone(&self.0.schema);
        let mut record = self.write();
        let previous = record.state;
        let columns = schema.columns();

        let mut command = match previous {
            EntityState::New => {
                let values = columns
                    .iter()
                    .zip(record.fields.iter())
                    .filter(|(c, v)| !(schema.is_primary_key(c) && v.is_null()))
                    .map(|(c, v)| (c.clone(), v.clone()))
                    .collect();
                let command = TableCommand::insert(
                    schema.table(),
                    values,
                    schema.single_primary_key().map(str::to_string),
                );
                record.last_insert = command.insert_slot().cloned();
                record.state = EntityState::ScheduledInsert;
                command
            }
            state if state.is_loaded() => {
                let values: Vec<(String, Value)> = columns
                    .iter()
                    .enumerate()
                    .filter(|(i, c)| {
                        !schema.is_primary_key(c) && (record.solid || record.changes.contains(i))
                    })
                    .map(|(i, c)| (c.clone(), record.fields[i].clone()))
                    .collect();
                if values.is_empty() && !force_context {
                    return Ok(Command::noop(schema.table()));
                }
                let predicate = self.pk_predicate(&record)?;
                if state != EntityState::ScheduledInsert {
                    record.state = EntityState::ScheduledUpdate;
                }
                TableCommand::update(schema.table(), values, predicate)
            }
            _ => return Ok(Command::noop(schema.table())),
        };

        let taken = std::mem::take(&mut record.changes);
        drop(record);

        let entity = self.clone();
        command.on_complete(move |cmd| entity.complete_store(cmd));
        let entity = self.clone();
        command.on_rollback(move |cmd| {
            let mut record = entity.write();
            record.state = previous;
            record.changes.extend(taken);
            if cmd.kind() == CommandKind::Insert {
                record.last_insert = None;
            }
        });
        Ok(Command::Table(command))
    }

    fn complete_store(&self, command: &TableCommand) {
        let schema = &self.0.schema;
        let mut record = self.write();
        if command.kind() == CommandKind::Insert {
            if let (Some(pk), Some(id)) = (schema.single_primary_key(), command.inserted_id()) {
                if let Some(index) = schema.column_index(pk) {
                    if record.fields[index].is_null() {
                        record.fields[index] = id.clone();
                    }
                }
            }
            let ours = match (&record.last_insert, command.insert_slot()) {
                (Some(a), Some(b)) => a.same_slot(b),
                _ => false,
            };
            if ours {
                record.last_insert = None;
            }
        }
        for (column, value) in command.resolved_context() {
            if let Some(index) = schema.column_index(column) {
                record.fields[index] = value.clone();
            }
        }
        if record.state != EntityState::Deleted && record.state != EntityState::ScheduledDelete {
            record.state = EntityState::Loaded;
        }
        tracing::trace!(role = %schema.role(), command = %command.label(), "entity stored");
    }

    /// Produce the command deleting this entity; a no-op when there is
    /// no row to remove.
    #[allow(clippy::result_large_err)]
    pub fn queue_delete(&self) -> Result<Command> {
        let schema = Arc::clone(&self.0.schema);
        let mut record = self.write();
        let previous = record.state;
        if !previous.is_loaded() {
            return Ok(Command::noop(schema.table()));
        }
        let predicate = self.pk_predicate(&record)?;
        record.state = EntityState::ScheduledDelete;
        drop(record);

        let mut command = TableCommand::delete(schema.table(), predicate);
        let entity = self.clone();
        command.on_complete(move |_| {
            let schema = Arc::clone(&entity.0.schema);
            let mut record = entity.write();
            record.state = EntityState::Deleted;
            record.last_insert = None;
            for pk in schema.primary_key() {
                if let Some(index) = schema.column_index(pk) {
                    record.fields[index] = Value::Null;
                }
            }
        });
        let entity = self.clone();
        command.on_rollback(move |_| {
            entity.write().state = previous;
        });
        Ok(Command::Table(command))
    }
}
