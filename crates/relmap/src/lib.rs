//! relmap - relational data mapping built on asupersync.
//!
//! relmap maps rows onto dynamically typed entities and back:
//!
//! - Schemas describe roles, columns and relations, validated up front
//! - Saves become an ordered command graph executed in one transaction,
//!   with generated keys flowing into dependent commands
//! - Reads compose a loader tree of joined and postload relations, parsed
//!   into nested records and materialized through a session entity map
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! async fn example(cx: &Cx, conn: impl Connection) -> Result<()> {
//!     let registry = SchemaRegistry::new()
//!         .with(
//!             EntitySchema::builder("user")
//!                 .table("users")
//!                 .primary_key("id")
//!                 .column("name")
//!                 .relation("posts", RelationSchema::has_many("post", "id", "user_id"))
//!                 .build()?,
//!         )?
//!         .with(
//!             EntitySchema::builder("post")
//!                 .table("posts")
//!                 .primary_key("id")
//!                 .column("title")
//!                 .column("user_id")
//!                 .build()?,
//!         )?;
//!     let orm = Orm::new(registry, conn)?;
//!
//!     // Insert a user and its first post; the post receives the new id
//!     let user = orm.make("user", &[("name".into(), Value::from("Ann"))])?;
//!     let post = orm.make("post", &[("title".into(), Value::from("hello"))])?;
//!     user.add("posts", post)?;
//!     orm.save(cx, &user).await;
//!
//!     // Load users with their posts in a second statement
//!     let mut map = orm.entity_map();
//!     let users = orm
//!         .select("user")?
//!         .load("posts", LoadMethod::Postload)
//!         .fetch_all(cx, &mut map)
//!         .await;
//!     Ok(())
//! }
//! ```

pub use relmap_core::{
    CacheError, ColumnRef, CommandError, CommandErrorKind, Condition, ConfigError,
    Connection, ConnectionError, ConnectionErrorKind, Cursor, Cx, DeleteQuery, Dialect, Error,
    FromValue, InsertQuery, Join, JoinType, LoaderError, OrderBy, Outcome, QueryError,
    QueryErrorKind, RecordError, RelationError, Result, Row, SelectQuery, TransactionError,
    TransactionErrorKind, TypeError, UpdateQuery, Value, is_valid_identifier, try_outcome,
    validate_identifier,
};
pub use relmap_orm::{
    BelongsTo, BelongsToMorphed, Bind, Command, CommandGraph, CommandKind, ContextSlot, Criteria,
    EntityMap, EntityRef, EntitySchema, EntitySchemaBuilder, EntityState, HasMany, HasOne,
    LoadMethod, LoaderTree, ManyToMany, Materializer, NodeKind, NodeSpec, NodeTree, Orm,
    OrmConfig, ParsedRecord, ParsedRelation, PivotData, PivotSchema, PivotedRecord, Relation,
    RelationKind, RelationSchema, SchemaRegistry, Selector, TableCommand,
};

/// Everything needed to declare schemas, save entities and load them.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Storage seam
        Connection,
        Dialect,
        Error,
        Result,
        Row,
        Value,
        // Schemas
        EntitySchema,
        PivotSchema,
        RelationSchema,
        SchemaRegistry,
        // Entities and relations
        Criteria,
        EntityMap,
        EntityRef,
        EntityState,
        LoadMethod,
        // Unit of work
        CommandGraph,
        // Entry point
        Orm,
        OrmConfig,
        Selector,
    };
}
