//! Object mapping for relmap.
//!
//! This crate turns rows into entities and entity changes back into ordered
//! statements:
//!
//! - `EntitySchema` / `SchemaRegistry` - roles, columns and relations
//! - `EntityRef` - shared entity handle with a lifecycle state machine
//! - relation proxies (belongs-to, has-one, has-many, many-to-many, morphed)
//! - `Command` / `CommandGraph` - unit of work with context propagation and
//!   all-or-nothing rollback
//! - `LoaderTree` / `NodeTree` - joined and postload fetching, row parsing
//!   with deduplication
//! - `Selector`, `Materializer` and `EntityMap` - query entry point and
//!   session-scoped identity
//! - `Orm` - schemas, connection and configuration in one handle

pub mod command;
pub mod config;
pub mod entity;
pub mod graph;
pub mod identity_map;
pub mod loader;
pub mod materialize;
pub mod node;
pub mod orm;
pub mod relation;
pub mod schema;
pub mod selector;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use command::{Bind, Command, CommandKind, ContextSlot, TableCommand};
pub use config::OrmConfig;
pub use entity::{EntityRef, EntityState};
pub use graph::CommandGraph;
pub use identity_map::EntityMap;
pub use loader::{LoadMethod, LoaderTree};
pub use materialize::Materializer;
pub use node::{
    NodeId, NodeKind, NodeSpec, NodeTree, ParsedRecord, ParsedRelation, PivotedRecord,
};
pub use orm::Orm;
pub use relation::{
    BelongsTo, BelongsToMorphed, Criteria, HasMany, HasOne, ManyToMany, PivotData, Relation,
};
pub use schema::{
    EntitySchema, EntitySchemaBuilder, PivotSchema, RelationKind, RelationSchema, SchemaRegistry,
};
pub use selector::Selector;
