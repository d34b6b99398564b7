//! Belongs-to over several target roles, discriminated by a morph key.
//!
//! Saving writes both the foreign key and the parent's role into the owner.
//! The relation loads lazily only: the target role is known per owner row.

use super::BelongsTo;
use crate::entity::EntityRef;
use crate::schema::RelationSchema;
use relmap_core::Result;

#[derive(Debug)]
pub struct BelongsToMorphed {
    base: BelongsTo,
}

impl BelongsToMorphed {
    pub(crate) fn new(name: String, schema: RelationSchema) -> Self {
        Self {
            base: BelongsTo::new(name, schema),
        }
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn schema(&self) -> &RelationSchema {
        self.base.schema()
    }

    pub fn is_loaded(&self) -> bool {
        self.base.is_loaded()
    }

    pub fn get(&self) -> Option<EntityRef> {
        self.base.get()
    }

    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, entity: Option<EntityRef>) -> Result<()> {
        self.base.set(entity)
    }

    pub(crate) fn install(&mut self, entity: Option<EntityRef>) {
        self.base.install(entity);
    }

    pub(crate) fn peek(&self) -> (Option<EntityRef>, bool) {
        self.base.peek()
    }

    pub(crate) fn base_mut(&mut self) -> &mut BelongsTo {
        &mut self.base
    }
}

/// Role named by the owner's morph key, if it is one of the targets.
pub(crate) fn morph_target(owner: &EntityRef, schema: &RelationSchema) -> Option<String> {
    let morph_key = schema.morph_key.as_deref()?;
    let value = owner.get(morph_key)?;
    let role = value.as_str()?;
    schema.accepts(role).then(|| role.to_string())
}
