//! Query entry point.
//!
//! A [`Selector`] collects loads, joins and filters for one role and fetches
//! either the raw nested records or entities materialized through an
//! [`EntityMap`]. Builder methods never fail; the first error is kept and
//! returned by the fetch.
//!
//! # Example
//!
//! ```ignore
//! let mut map = orm.entity_map();
//! let users = orm
//!     .select("user")?
//!     .load("posts.tags", LoadMethod::Postload)
//!     .where_eq("name", "Ann")
//!     .order_by("id", true)
//!     .fetch_all(&cx, &mut map)
//!     .await;
//! ```

use crate::entity::EntityRef;
use crate::identity_map::EntityMap;
use crate::loader::{LoadMethod, LoaderTree};
use crate::materialize::Materializer;
use crate::node::ParsedRecord;
use crate::orm::Orm;
use asupersync::{Cx, Outcome};
use relmap_core::{Condition, Connection, Error, Result, Value, try_outcome};

pub struct Selector<'a, C: Connection> {
    orm: &'a Orm<C>,
    tree: LoaderTree,
    error: Option<Error>,
}

impl<'a, C: Connection> Selector<'a, C> {
    pub(crate) fn new(orm: &'a Orm<C>, tree: LoaderTree) -> Self {
        Self {
            orm,
            tree,
            error: None,
        }
    }

    fn apply(mut self, f: impl FnOnce(&mut LoaderTree) -> Result<()>) -> Self {
        if self.error.is_none() {
            if let Err(e) = f(&mut self.tree) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Load the relation at a dotted path.
    pub fn load(self, path: &str, method: LoadMethod) -> Self {
        self.apply(|tree| tree.load(path, method))
    }

    /// Load with the method each relation declares, falling back to the
    /// configured default.
    pub fn load_default(self, path: &str) -> Self {
        let fallback = self.orm.config().default_load_method;
        self.apply(|tree| tree.load_preferred(path, fallback))
    }

    /// Join a relation for filtering only.
    pub fn with(self, path: &str) -> Self {
        self.apply(|tree| tree.with(path))
    }

    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.apply(|tree| {
            let column = tree.resolve_column(column)?;
            tree.filter(Condition::Eq(column, value));
            Ok(())
        })
    }

    pub fn where_in(self, column: &str, values: Vec<Value>) -> Self {
        self.apply(|tree| {
            let column = tree.resolve_column(column)?;
            tree.filter(Condition::In(column, values));
            Ok(())
        })
    }

    pub fn where_null(self, column: &str) -> Self {
        self.apply(|tree| {
            let column = tree.resolve_column(column)?;
            tree.filter(Condition::IsNull(column));
            Ok(())
        })
    }

    pub fn order_by(self, column: &str, ascending: bool) -> Self {
        self.apply(|tree| {
            let column = tree.resolve_column(column)?;
            tree.order_by(column, ascending);
            Ok(())
        })
    }

    pub fn limit(self, limit: u64) -> Self {
        self.apply(|tree| {
            tree.limit(limit);
            Ok(())
        })
    }

    /// The loader tree built so far.
    pub fn loader(&self) -> &LoaderTree {
        &self.tree
    }

    /// Nested records, without materialization.
    #[tracing::instrument(level = "debug", skip_all, fields(role = %self.tree.role()))]
    pub async fn fetch_data(self, cx: &Cx) -> Outcome<Vec<ParsedRecord>, Error> {
        if let Some(e) = self.error {
            return Outcome::Err(e);
        }
        let nodes = try_outcome!(
            self.tree
                .execute(cx, self.orm.connection(), self.orm.dialect())
                .await
        );
        Outcome::Ok(nodes.result())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(role = %self.tree.role()))]
    pub async fn fetch_all(self, cx: &Cx, map: &mut EntityMap) -> Outcome<Vec<EntityRef>, Error> {
        let orm = self.orm;
        let role = self.tree.role().to_string();
        let records = try_outcome!(self.fetch_data(cx).await);
        let mut materializer =
            Materializer::new(orm.registry(), map, orm.config().ignore_cache_limit);
        Outcome::Ok(try_outcome!(result: materializer.all(&role, &records)))
    }

    pub async fn fetch_one(
        self,
        cx: &Cx,
        map: &mut EntityMap,
    ) -> Outcome<Option<EntityRef>, Error> {
        let selector = if self.tree.has_joined_collections() {
            self
        } else {
            self.limit(1)
        };
        let entities = try_outcome!(selector.fetch_all(cx, map).await);
        Outcome::Ok(entities.into_iter().next())
    }

    /// Entity by primary key; a mapped entity is returned without a query
    /// when no relation was requested.
    pub async fn find_by_pk(
        self,
        cx: &Cx,
        map: &mut EntityMap,
        pk: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let pk = pk.into();
        let schema = std::sync::Arc::clone(self.tree.root_schema());
        let Some(column) = schema.single_primary_key() else {
            return Outcome::Err(Error::loader(format!(
                "'{}' has no single-column primary key",
                schema.role()
            )));
        };
        if self.error.is_none() && self.tree.relation_count() == 0 {
            if let Some(entity) = map.get(schema.role(), std::slice::from_ref(&pk)) {
                tracing::trace!(role = %schema.role(), "find_by_pk served from entity map");
                return Outcome::Ok(Some(entity));
            }
        }
        self.where_eq(column, pk).fetch_one(cx, map).await
    }
}
