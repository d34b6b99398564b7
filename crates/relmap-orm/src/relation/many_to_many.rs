//! Many-to-many: links live in a pivot table.
//!
//! The proxy keeps every linked entity with its pivot data, plus three
//! disjoint sets describing what changed since the last save: newly linked,
//! pivot updated and unlinked. Saving turns them into pivot inserts,
//! updates and deletes respectively.

use super::{PivotData, contains, ensure_accepts, merge_pivot, take_out};
use crate::command::{Bind, Command, TableCommand};
use crate::entity::{EntityRef, QueueScope, StoreMode};
use crate::schema::{PivotSchema, RelationSchema};
use relmap_core::{Error, Result};

#[derive(Debug)]
pub struct ManyToMany {
    name: String,
    schema: RelationSchema,
    loaded: bool,
    links: Vec<(EntityRef, PivotData)>,
    newly: Vec<EntityRef>,
    updated: Vec<EntityRef>,
    unlinked: Vec<EntityRef>,
}

struct Pending {
    newly: Vec<EntityRef>,
    updated: Vec<EntityRef>,
    unlinked: Vec<EntityRef>,
}

impl ManyToMany {
    pub(crate) fn new(name: String, schema: RelationSchema) -> Self {
        Self {
            name,
            schema,
            loaded: false,
            links: Vec::new(),
            newly: Vec::new(),
            updated: Vec::new(),
            unlinked: Vec::new(),
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

    /// Linked entities, in link order.
    pub fn linked(&self) -> Vec<EntityRef> {
        self.links.iter().map(|(e, _)| e.clone()).collect()
    }

    /// Entities unlinked since the last save.
    pub fn unlinked(&self) -> &[EntityRef] {
        &self.unlinked
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn link_index(&self, entity: &EntityRef) -> Option<usize> {
        self.links.iter().position(|(e, _)| e.ptr_eq(entity))
    }

    /// Link `entity`, merging `pivot` into its data when already linked.
    #[allow(clippy::result_large_err)]
    pub fn link(&mut self, entity: EntityRef, pivot: PivotData) -> Result<()> {
        ensure_accepts(&self.name, &self.schema, &entity)?;
        if let Some(index) = self.link_index(&entity) {
            merge_pivot(&mut self.links[index].1, pivot);
            if !contains(&self.newly, &entity) && !contains(&self.updated, &entity) {
                self.updated.push(entity);
            }
            return Ok(());
        }
        if take_out(&mut self.unlinked, &entity) {
            self.updated.push(entity.clone());
        } else {
            self.newly.push(entity.clone());
        }
        self.links.push((entity, pivot));
        Ok(())
    }

    /// Remove the link to `entity`; unlinking a stranger is a no-op.
    #[allow(clippy::result_large_err)]
    pub fn unlink(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(index) = self.link_index(entity) else {
            return Ok(());
        };
        self.links.remove(index);
        if !take_out(&mut self.newly, entity) {
            take_out(&mut self.updated, entity);
            self.unlinked.push(entity.clone());
        }
        Ok(())
    }

    /// Link exactly `entities`; every other linked entity is unlinked.
    #[allow(clippy::result_large_err)]
    pub fn sync(&mut self, entities: Vec<EntityRef>) -> Result<()> {
        for entity in &entities {
            ensure_accepts(&self.name, &self.schema, entity)?;
        }
        let stale: Vec<EntityRef> = self
            .links
            .iter()
            .map(|(e, _)| e.clone())
            .filter(|e| !contains(&entities, e))
            .collect();
        for entity in &stale {
            self.unlink(entity)?;
        }
        for entity in entities {
            if self.link_index(&entity).is_none() {
                self.link(entity, PivotData::new())?;
            }
        }
        self.loaded = true;
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn get_pivot(&self, entity: &EntityRef) -> Result<PivotData> {
        self.link_index(entity)
            .map(|index| self.links[index].1.clone())
            .ok_or_else(|| Error::relation(self.name.clone(), "entity is not linked"))
    }

    /// Install fetched links, keeping local changes.
    pub(crate) fn install(&mut self, links: Vec<(EntityRef, PivotData)>) {
        if self.loaded {
            return;
        }
        let mut merged: Vec<(EntityRef, PivotData)> = links
            .into_iter()
            .filter(|(e, _)| !contains(&self.unlinked, e))
            .collect();
        for (entity, pivot) in self.links.drain(..) {
            match merged.iter_mut().find(|(e, _)| e.ptr_eq(&entity)) {
                Some(existing) => merge_pivot(&mut existing.1, pivot),
                None => merged.push((entity, pivot)),
            }
        }
        self.links = merged;
        self.loaded = true;
    }

    fn take_pending(&mut self) -> Pending {
        Pending {
            newly: std::mem::take(&mut self.newly),
            updated: std::mem::take(&mut self.updated),
            unlinked: std::mem::take(&mut self.unlinked),
        }
    }

    fn restore(&mut self, pending: Pending) {
        for entity in pending.newly {
            if self.link_index(&entity).is_some() && !contains(&self.newly, &entity) {
                self.newly.push(entity);
            }
        }
        for entity in pending.updated {
            if self.link_index(&entity).is_some()
                && !contains(&self.newly, &entity)
                && !contains(&self.updated, &entity)
            {
                self.updated.push(entity);
            }
        }
        for entity in pending.unlinked {
            if self.link_index(&entity).is_none() && !contains(&self.unlinked, &entity) {
                self.unlinked.push(entity);
            }
        }
    }
}

fn pivot_predicate(pivot: &PivotSchema, owner_key: &Bind, target_key: Bind) -> Vec<(String, Bind)> {
    vec![
        (pivot.inner_key.clone(), owner_key.clone()),
        (pivot.outer_key.clone(), target_key),
    ]
}

/// Store both endpoints, then write the pivot rows.
#[allow(clippy::result_large_err)]
pub(crate) fn queue(
    owner: &EntityRef,
    index: usize,
    command: &mut Command,
    scope: &mut QueueScope,
) -> Result<()> {
    let (name, declared) = &owner.schema().relations()[index];
    let Some(pivot) = declared.pivot.clone() else {
        return Err(Error::relation(name.clone(), "many-to-many relation has no pivot"));
    };
    let Some((schema, links, pending)) = owner.relation_at(index, |relation| match relation {
        super::Relation::ManyToMany(r) => {
            Some((r.schema.clone(), r.links.clone(), r.take_pending()))
        }
        _ => None,
    }) else {
        return Ok(());
    };

    {
        let owner = owner.clone();
        let snapshot = Pending {
            newly: pending.newly.clone(),
            updated: pending.updated.clone(),
            unlinked: pending.unlinked.clone(),
        };
        command.on_rollback(move |_| {
            owner.relation_at(index, |relation| {
                if let super::Relation::ManyToMany(r) = relation {
                    r.restore(snapshot);
                }
            });
        });
    }

    for (target, _) in &links {
        let target_command = target.queue_store_scoped(StoreMode::new(true), scope)?;
        command.push_after(target_command);
    }

    let owner_key = owner.key_bind(&schema.inner_key);
    let pivot_of = |entity: &EntityRef| {
        links
            .iter()
            .find(|(e, _)| e.ptr_eq(entity))
            .map(|(_, data)| data.clone())
            .unwrap_or_default()
    };

    for target in &pending.newly {
        let mut values = pivot.defaults.clone();
        merge_pivot(&mut values, pivot_of(target));
        let mut insert = TableCommand::insert(pivot.table.clone(), values, None);
        insert.add_context(pivot.inner_key.clone(), owner_key.clone());
        insert.add_context(pivot.outer_key.clone(), target.key_bind(&schema.outer_key));
        command.push_after(insert);
    }
    for target in &pending.updated {
        let values = pivot_of(target);
        if values.is_empty() {
            continue;
        }
        command.push_after(TableCommand::update(
            pivot.table.clone(),
            values,
            pivot_predicate(&pivot, &owner_key, target.key_bind(&schema.outer_key)),
        ));
    }
    for target in &pending.unlinked {
        command.push_after(TableCommand::delete(
            pivot.table.clone(),
            pivot_predicate(&pivot, &owner_key, target.key_bind(&schema.outer_key)),
        ));
    }
    Ok(())
}
