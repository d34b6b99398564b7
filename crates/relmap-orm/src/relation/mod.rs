//! Relation proxies.
//!
//! Every entity holds one [`Relation`] per declared relation. A proxy starts
//! NOT LOADED and becomes LOADED when data is installed by a loader or when
//! the application assigns to it. At save time each proxy wraps the owner's
//! command with the commands its own bookkeeping requires:
//!
//! | Kind              | Before owner        | After owner                        |
//! |-------------------|---------------------|------------------------------------|
//! | belongs-to        | parent store        |                                    |
//! | has-one           |                     | child store, previous child nulled |
//! | has-many          |                     | member stores, removed nulled      |
//! | many-to-many      |                     | endpoint stores, pivot commands    |
//! | belongs-to-morphed| parent store        |                                    |

mod belongs_to;
mod has_many;
mod has_one;
mod many_to_many;
mod morphed;

pub use belongs_to::BelongsTo;
pub use has_many::HasMany;
pub use has_one::HasOne;
pub use many_to_many::ManyToMany;
pub use morphed::BelongsToMorphed;

pub(crate) use morphed::morph_target;

use crate::command::Command;
use crate::entity::{EntityRef, QueueScope};
use crate::schema::{RelationKind, RelationSchema};
use relmap_core::{Error, Result, Value};

/// Association columns attached to one many-to-many link.
pub type PivotData = Vec<(String, Value)>;

/// Merge `incoming` into `base`; incoming keys win.
pub(crate) fn merge_pivot(base: &mut PivotData, incoming: PivotData) {
    for (column, value) in incoming {
        match base.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => base.push((column, value)),
        }
    }
}

pub(crate) fn position(list: &[EntityRef], entity: &EntityRef) -> Option<usize> {
    list.iter().position(|e| e.ptr_eq(entity))
}

pub(crate) fn contains(list: &[EntityRef], entity: &EntityRef) -> bool {
    position(list, entity).is_some()
}

/// Remove `entity` from `list`, reporting whether it was present.
pub(crate) fn take_out(list: &mut Vec<EntityRef>, entity: &EntityRef) -> bool {
    match position(list, entity) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn ensure_accepts(name: &str, schema: &RelationSchema, entity: &EntityRef) -> Result<()> {
    if schema.accepts(entity.role()) {
        Ok(())
    } else {
        Err(Error::relation(
            name,
            format!(
                "expected an entity of role '{}', got '{}'",
                schema.targets.join("' or '"),
                entity.role()
            ),
        ))
    }
}

/// Selects members of a relation.
#[derive(Debug, Clone)]
pub enum Criteria {
    /// The very same instance.
    Entity(EntityRef),
    /// Primary key equal to the value.
    PrimaryKey(Value),
    /// Every listed field equal.
    Fields(Vec<(String, Value)>),
}

impl Criteria {
    pub fn field(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Criteria::Fields(vec![(column.into(), value.into())])
    }

    /// Add a field condition; turns the criteria into `Fields`.
    pub fn and(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = match self {
            Criteria::Fields(fields) => fields,
            _ => Vec::new(),
        };
        fields.push((column.into(), value.into()));
        Criteria::Fields(fields)
    }

    pub fn matches(&self, candidate: &EntityRef) -> bool {
        match self {
            Criteria::Entity(entity) => entity.ptr_eq(candidate),
            Criteria::PrimaryKey(pk) => candidate
                .primary_key()
                .is_some_and(|value| value.loosely_eq(pk)),
            Criteria::Fields(fields) => fields.iter().all(|(column, expected)| {
                candidate.get(column).is_some_and(|value| {
                    (value.is_null() && expected.is_null()) || value.loosely_eq(expected)
                })
            }),
        }
    }
}

/// Data installed into a proxy by a loader.
#[derive(Debug)]
pub(crate) enum Loaded {
    Single(Option<EntityRef>),
    Many(Vec<EntityRef>),
    Pivoted(Vec<(EntityRef, PivotData)>),
}

/// One relation of one entity.
#[derive(Debug)]
pub enum Relation {
    BelongsTo(BelongsTo),
    HasOne(HasOne),
    HasMany(HasMany),
    ManyToMany(ManyToMany),
    BelongsToMorphed(BelongsToMorphed),
}

impl Relation {
    pub(crate) fn from_schema(name: &str, schema: &RelationSchema) -> Self {
        let name = name.to_string();
        let schema = schema.clone();
        match schema.kind {
            RelationKind::BelongsTo => Relation::BelongsTo(BelongsTo::new(name, schema)),
            RelationKind::HasOne => Relation::HasOne(HasOne::new(name, schema)),
            RelationKind::HasMany => Relation::HasMany(HasMany::new(name, schema)),
            RelationKind::ManyToMany => Relation::ManyToMany(ManyToMany::new(name, schema)),
            RelationKind::BelongsToMorphed => {
                Relation::BelongsToMorphed(BelongsToMorphed::new(name, schema))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Relation::BelongsTo(r) => r.name(),
            Relation::HasOne(r) => r.name(),
            Relation::HasMany(r) => r.name(),
            Relation::ManyToMany(r) => r.name(),
            Relation::BelongsToMorphed(r) => r.name(),
        }
    }

    pub fn schema(&self) -> &RelationSchema {
        match self {
            Relation::BelongsTo(r) => r.schema(),
            Relation::HasOne(r) => r.schema(),
            Relation::HasMany(r) => r.schema(),
            Relation::ManyToMany(r) => r.schema(),
            Relation::BelongsToMorphed(r) => r.schema(),
        }
    }

    pub fn kind(&self) -> RelationKind {
        self.schema().kind
    }

    pub fn is_loaded(&self) -> bool {
        match self {
            Relation::BelongsTo(r) => r.is_loaded(),
            Relation::HasOne(r) => r.is_loaded(),
            Relation::HasMany(r) => r.is_loaded(),
            Relation::ManyToMany(r) => r.is_loaded(),
            Relation::BelongsToMorphed(r) => r.is_loaded(),
        }
    }

    fn unsupported(&self, operation: &str) -> Error {
        Error::relation(
            self.name(),
            format!(
                "'{}' is not supported by {} relations",
                operation,
                self.kind().as_str()
            ),
        )
    }

    /// Related entity of a single-valued relation.
    #[allow(clippy::result_large_err)]
    pub fn get(&self) -> Result<Option<EntityRef>> {
        match self {
            Relation::BelongsTo(r) => Ok(r.get()),
            Relation::HasOne(r) => Ok(r.get()),
            Relation::BelongsToMorphed(r) => Ok(r.get()),
            _ => Err(self.unsupported("get")),
        }
    }

    /// Assign a single-valued relation.
    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, entity: Option<EntityRef>) -> Result<()> {
        match self {
            Relation::BelongsTo(r) => r.set(entity),
            Relation::HasOne(r) => r.set(entity),
            Relation::BelongsToMorphed(r) => r.set(entity),
            _ => Err(self.unsupported("set")),
        }
    }

    /// Current members, in order.
    pub fn instances(&self) -> Vec<EntityRef> {
        match self {
            Relation::BelongsTo(r) => r.get().into_iter().collect(),
            Relation::HasOne(r) => r.get().into_iter().collect(),
            Relation::BelongsToMorphed(r) => r.get().into_iter().collect(),
            Relation::HasMany(r) => r.instances().to_vec(),
            Relation::ManyToMany(r) => r.linked(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Relation::HasMany(r) => r.len(),
            Relation::ManyToMany(r) => r.len(),
            _ => self.instances().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, entity: EntityRef) -> Result<()> {
        match self {
            Relation::HasMany(r) => r.add(entity),
            _ => Err(self.unsupported("add")),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        match self {
            Relation::HasMany(r) => r.delete(entity),
            _ => Err(self.unsupported("delete")),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn link(&mut self, entity: EntityRef, pivot: PivotData) -> Result<()> {
        match self {
            Relation::ManyToMany(r) => r.link(entity, pivot),
            _ => Err(self.unsupported("link")),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn unlink(&mut self, entity: &EntityRef) -> Result<()> {
        match self {
            Relation::ManyToMany(r) => r.unlink(entity),
            _ => Err(self.unsupported("unlink")),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn sync(&mut self, entities: Vec<EntityRef>) -> Result<()> {
        match self {
            Relation::ManyToMany(r) => r.sync(entities),
            _ => Err(self.unsupported("sync")),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn get_pivot(&self, entity: &EntityRef) -> Result<PivotData> {
        match self {
            Relation::ManyToMany(r) => r.get_pivot(entity),
            _ => Err(self.unsupported("get_pivot")),
        }
    }

    /// Install fetched data; proxies already loaded keep their state.
    pub(crate) fn install(&mut self, data: Loaded) {
        match (self, data) {
            (Relation::BelongsTo(r), Loaded::Single(entity)) => r.install(entity),
            (Relation::HasOne(r), Loaded::Single(entity)) => r.install(entity),
            (Relation::BelongsToMorphed(r), Loaded::Single(entity)) => r.install(entity),
            (Relation::HasMany(r), Loaded::Many(entities)) => r.install(entities),
            (Relation::ManyToMany(r), Loaded::Pivoted(links)) => r.install(links),
            (relation, data) => {
                tracing::warn!(relation = %relation.name(), ?data, "mismatched relation data ignored");
            }
        }
    }
}

/// Whether a belongs-to style relation must write its key into the owner.
pub(crate) fn needs_context(owner: &EntityRef) -> bool {
    (0..owner.schema().relations().len()).any(|index| {
        let pending = owner.relation_at(index, |relation| match relation {
            Relation::BelongsTo(r) => Some(r.peek()),
            Relation::BelongsToMorphed(r) => Some(r.peek()),
            _ => None,
        });
        let relation = &owner.schema().relations()[index].1;
        match pending {
            Some((instance, changed)) => {
                belongs_to::wants_context(owner, relation, instance.as_ref(), changed)
            }
            None => false,
        }
    })
}

/// Wrap the owner's command with the commands of every relation.
#[allow(clippy::result_large_err)]
pub(crate) fn queue_relations(
    owner: &EntityRef,
    command: &mut Command,
    scope: &mut QueueScope,
) -> Result<()> {
    let schema = std::sync::Arc::clone(owner.schema());
    for (index, (_, relation)) in schema.relations().iter().enumerate() {
        match relation.kind {
            RelationKind::BelongsTo | RelationKind::BelongsToMorphed => {
                belongs_to::queue(owner, index, command, scope)?;
            }
            RelationKind::HasOne => has_one::queue(owner, index, command, scope)?,
            RelationKind::HasMany => has_many::queue(owner, index, command, scope)?,
            RelationKind::ManyToMany => many_to_many::queue(owner, index, command, scope)?,
        }
    }
    Ok(())
}
