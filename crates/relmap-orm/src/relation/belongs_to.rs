//! Belongs-to: the owner holds the foreign key.

use super::ensure_accepts;
use crate::command::{Bind, Command};
use crate::entity::{EntityRef, QueueScope, StoreMode};
use crate::schema::RelationSchema;
use relmap_core::{Error, Result, Value};

#[derive(Debug)]
pub struct BelongsTo {
    name: String,
    schema: RelationSchema,
    loaded: bool,
    instance: Option<EntityRef>,
    changed: bool,
}

impl BelongsTo {
    pub(crate) fn new(name: String, schema: RelationSchema) -> Self {
        Self {
            name,
            schema,
            loaded: false,
            instance: None,
            changed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &RelationSchema {
        &self.schema
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self) -> Option<EntityRef> {
        self.instance.clone()
    }

    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, entity: Option<EntityRef>) -> Result<()> {
        if let Some(entity) = &entity {
            ensure_accepts(&self.name, &self.schema, entity)?;
        }
        let same = match (&self.instance, &entity) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => self.loaded,
            _ => false,
        };
        if !same {
            self.instance = entity;
            self.changed = true;
        }
        self.loaded = true;
        Ok(())
    }

    pub(crate) fn install(&mut self, entity: Option<EntityRef>) {
        if !self.loaded {
            self.instance = entity;
            self.loaded = true;
        }
    }

    pub(crate) fn peek(&self) -> (Option<EntityRef>, bool) {
        (self.instance.clone(), self.changed)
    }

    /// Snapshot for queueing; the change flag is consumed.
    fn take(&mut self) -> (Option<EntityRef>, bool) {
        let changed = std::mem::take(&mut self.changed);
        (self.instance.clone(), changed)
    }

    fn restore(&mut self) {
        self.changed = true;
    }
}

/// Whether the owner row must receive this relation's key.
pub(crate) fn wants_context(
    owner: &EntityRef,
    schema: &RelationSchema,
    instance: Option<&EntityRef>,
    changed: bool,
) -> bool {
    if changed {
        return true;
    }
    let Some(parent) = instance else {
        return false;
    };
    let bind = parent.key_bind(&schema.outer_key);
    if !owner.holds(&schema.inner_key, &bind) {
        return true;
    }
    match &schema.morph_key {
        Some(morph_key) => !owner.holds(morph_key, &Bind::Value(Value::from(parent.role()))),
        None => false,
    }
}

fn pending(relation: &mut super::Relation) -> Option<&mut BelongsTo> {
    match relation {
        super::Relation::BelongsTo(r) => Some(r),
        super::Relation::BelongsToMorphed(r) => Some(r.base_mut()),
        _ => None,
    }
}

/// Store the parent before the owner and push its key into the owner.
#[allow(clippy::result_large_err)]
pub(crate) fn queue(
    owner: &EntityRef,
    index: usize,
    command: &mut Command,
    scope: &mut QueueScope,
) -> Result<()> {
    let Some((name, schema, instance, changed)) = owner.relation_at(index, |relation| {
        pending(relation).map(|r| {
            let (instance, changed) = r.take();
            (r.name.clone(), r.schema.clone(), instance, changed)
        })
    }) else {
        return Ok(());
    };

    let restore = move |owner: &EntityRef| {
        owner.relation_at(index, |relation| {
            if let Some(r) = pending(relation) {
                r.restore();
            }
        });
    };

    let wants = wants_context(owner, &schema, instance.as_ref(), changed);
    match &instance {
        Some(parent) => {
            let parent_command = match parent.queue_store_scoped(StoreMode::new(true), scope) {
                Ok(parent_command) => parent_command,
                Err(e) => {
                    if changed {
                        restore(owner);
                    }
                    return Err(e);
                }
            };
            if wants {
                command.add_context(schema.inner_key.clone(), parent.key_bind(&schema.outer_key));
                if let Some(morph_key) = &schema.morph_key {
                    command.add_context(morph_key.clone(), Value::from(parent.role()));
                }
            }
            command.push_before(parent_command);
        }
        None if changed => {
            if !schema.nullable {
                restore(owner);
                return Err(Error::relation(
                    name,
                    "relation is not nullable and cannot be cleared",
                ));
            }
            command.add_context(schema.inner_key.clone(), Value::Null);
            if let Some(morph_key) = &schema.morph_key {
                command.add_context(morph_key.clone(), Value::Null);
            }
        }
        None => {}
    }

    if changed {
        let owner = owner.clone();
        command.on_rollback(move |_| restore(&owner));
    }
    Ok(())
}
