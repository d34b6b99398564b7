//! The ORM handle: schemas, a connection and configuration.

use crate::config::OrmConfig;
use crate::entity::EntityRef;
use crate::graph::CommandGraph;
use crate::identity_map::EntityMap;
use crate::loader::{LoadMethod, LoaderTree};
use crate::materialize::Materializer;
use crate::relation::{Criteria, Loaded, morph_target};
use crate::schema::{RelationKind, SchemaRegistry};
use crate::selector::Selector;
use asupersync::{Cx, Outcome};
use relmap_core::{Connection, Dialect, Error, Result, Value, try_outcome};
use std::sync::Arc;

/// Entry point for reads and writes.
///
/// # Example
///
/// ```ignore
/// let orm = Orm::new(registry, conn)?;
///
/// let user = orm.make("user", &[("name".into(), Value::from("Ann"))])?;
/// orm.save(&cx, &user).await;
///
/// let mut map = orm.entity_map();
/// let found = orm.select("user")?.find_by_pk(&cx, &mut map, 1_i64).await;
/// ```
#[derive(Debug)]
pub struct Orm<C: Connection> {
    registry: Arc<SchemaRegistry>,
    conn: C,
    config: OrmConfig,
}

impl<C: Connection> Orm<C> {
    /// Create an ORM after validating every relation of the registry.
    #[allow(clippy::result_large_err)]
    pub fn new(registry: SchemaRegistry, conn: C) -> Result<Self> {
        Self::with_config(registry, conn, OrmConfig::default())
    }

    #[allow(clippy::result_large_err)]
    pub fn with_config(registry: SchemaRegistry, conn: C, config: OrmConfig) -> Result<Self> {
        registry.validate()?;
        tracing::debug!(roles = registry.len(), "ORM ready");
        Ok(Self {
            registry: Arc::new(registry),
            conn,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    /// Dialect used to render statements.
    pub fn dialect(&self) -> Dialect {
        self.config.dialect.unwrap_or_else(|| self.conn.dialect())
    }

    /// Fresh entity map bounded by the configured cache limit.
    pub fn entity_map(&self) -> EntityMap {
        EntityMap::new(self.config.entity_cache_limit)
    }

    /// New entity of `role` with the given fields set.
    #[allow(clippy::result_large_err)]
    pub fn make(&self, role: &str, values: &[(String, Value)]) -> Result<EntityRef> {
        let entity = EntityRef::new(self.registry.get(role)?);
        for (field, value) in values {
            entity.set(field, value.clone())?;
        }
        Ok(entity)
    }

    #[allow(clippy::result_large_err)]
    pub fn select(&self, role: &str) -> Result<Selector<'_, C>> {
        Ok(Selector::new(
            self,
            LoaderTree::new(Arc::clone(&self.registry), role)?,
        ))
    }

    /// Empty command graph rendering in this ORM's dialect.
    pub fn command_graph(&self) -> CommandGraph {
        CommandGraph::new().with_dialect(self.dialect())
    }

    pub async fn run(&self, cx: &Cx, graph: CommandGraph) -> Outcome<(), Error> {
        graph.run(cx, &self.conn).await
    }

    /// Store `entity` with its relations in one transaction.
    pub async fn save(&self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let mut graph = self.command_graph();
        try_outcome!(result: graph.store(entity, true));
        self.run(cx, graph).await
    }

    /// Delete `entity` in one transaction.
    pub async fn delete(&self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        let mut graph = self.command_graph();
        try_outcome!(result: graph.delete(entity));
        self.run(cx, graph).await
    }

    /// Fetch the relation `name` of `entity` and install it when the proxy
    /// is not loaded yet. Returns the fetched entities.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, map), fields(role = %entity.role()))]
    pub async fn load_relation(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        name: &str,
        map: &mut EntityMap,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let schema = Arc::clone(entity.schema());
        let Some(relation) = schema.relation(name) else {
            return Outcome::Err(Error::record(
                schema.role(),
                format!("unknown relation '{}'", name),
            ));
        };

        let data = if relation.kind == RelationKind::BelongsToMorphed {
            let key = entity.get(&relation.inner_key).filter(|v| !v.is_null());
            let related = match (morph_target(entity, relation), key) {
                (Some(role), Some(key)) => try_outcome!(
                    try_outcome!(result: self.select(&role))
                        .where_eq(&relation.outer_key, key)
                        .fetch_one(cx, map)
                        .await
                ),
                _ => None,
            };
            Loaded::Single(related)
        } else {
            let mut tree = LoaderTree::seeded(Arc::clone(&self.registry), Arc::clone(&schema));
            try_outcome!(result: tree.load(name, LoadMethod::Postload));
            let fields = entity.fields();
            let nodes = try_outcome!(
                tree.execute_seeded(cx, &self.conn, self.dialect(), &fields)
                    .await
            );
            let records = nodes.result();
            let Some(parsed) = records.first().and_then(|r| r.relation(name)) else {
                return Outcome::Err(Error::loader(format!(
                    "lazy load of '{}' produced no data",
                    name
                )));
            };
            let mut materializer =
                Materializer::new(&self.registry, map, self.config.ignore_cache_limit);
            try_outcome!(result: materializer.relation(relation, parsed))
        };

        let related = data.entities();
        try_outcome!(result: entity.with_relation(name, |r| {
            r.install(data);
            Ok(())
        }));
        Outcome::Ok(related)
    }

    /// Load the relation unless the proxy is already loaded.
    pub async fn ensure_loaded(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        name: &str,
        map: &mut EntityMap,
    ) -> Outcome<(), Error> {
        if try_outcome!(result: entity.is_relation_loaded(name)) {
            return Outcome::Ok(());
        }
        try_outcome!(self.load_relation(cx, entity, name, map).await);
        Outcome::Ok(())
    }

    /// [`EntityRef::has`] after loading the relation if needed.
    pub async fn has(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        name: &str,
        criteria: &Criteria,
        map: &mut EntityMap,
    ) -> Outcome<bool, Error> {
        try_outcome!(self.ensure_loaded(cx, entity, name, map).await);
        Outcome::Ok(try_outcome!(result: entity.has(name, criteria)))
    }
}
