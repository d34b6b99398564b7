//! Loader tree.
//!
//! A [`LoaderTree`] plans how one root role and its requested relations are
//! fetched. Joined loaders extend the statement of their parent; postload
//! loaders issue their own `WHERE key IN (...)` statement once the parent's
//! rows have been parsed. Every statement feeds the same [`NodeTree`].
//!
//! Table aliases are stable: the root uses its role, a child uses
//! `<parent alias>_<relation>`, and a pivot table `<alias>_pivot`.

use crate::node::{NodeId, NodeKind, NodeSpec, NodeTree};
use crate::schema::{EntitySchema, RelationKind, RelationSchema, SchemaRegistry};
use asupersync::{Cx, Outcome};
use relmap_core::{
    ColumnRef, Condition, Connection, Dialect, Error, Join, JoinType, Result, SelectQuery, Value,
    try_outcome,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// How a relation's rows are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMethod {
    /// Separate deferred query keyed by the parent rows.
    #[default]
    Postload,
    /// LEFT JOIN into the parent statement.
    Inload,
    /// INNER JOIN into the parent statement; parents without a match are
    /// filtered out.
    Join,
}

impl LoadMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LoadMethod::Postload => "postload",
            LoadMethod::Inload => "inload",
            LoadMethod::Join => "join",
        }
    }

    /// Whether the relation shares its parent's statement.
    pub const fn is_joined(&self) -> bool {
        matches!(self, LoadMethod::Inload | LoadMethod::Join)
    }

    const fn join_type(&self) -> Option<JoinType> {
        match self {
            LoadMethod::Postload => None,
            LoadMethod::Inload => Some(JoinType::Left),
            LoadMethod::Join => Some(JoinType::Inner),
        }
    }
}

#[derive(Debug)]
struct Loader {
    alias: String,
    schema: Arc<EntitySchema>,
    relation: Option<(String, RelationSchema)>,
    /// `None` for the root and for postload loaders.
    join: Option<JoinType>,
    /// `false` for joiners, which only filter.
    loads: bool,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl Loader {
    fn relation(&self) -> Option<&RelationSchema> {
        self.relation.as_ref().map(|(_, r)| r)
    }

    fn pivot_alias(&self) -> String {
        format!("{}_pivot", self.alias)
    }

    fn node_spec(&self) -> NodeSpec {
        let columns = self.schema.columns().to_vec();
        let Some((name, relation)) = &self.relation else {
            return NodeSpec::root(columns, self.schema.primary_key().to_vec());
        };
        let (kind, pivot_columns, local_key, duplicate_criteria) = match (&relation.pivot, relation.kind) {
            (Some(pivot), RelationKind::ManyToMany) => (
                NodeKind::Pivoted,
                pivot.all_columns(),
                pivot.inner_key.clone(),
                vec![pivot.inner_key.clone(), pivot.outer_key.clone()],
            ),
            (_, kind) => (
                if kind.is_singular() {
                    NodeKind::Singular
                } else {
                    NodeKind::Array
                },
                Vec::new(),
                relation.outer_key.clone(),
                self.schema.primary_key().to_vec(),
            ),
        };
        NodeSpec {
            kind,
            relation: Some(name.clone()),
            columns,
            pivot_columns,
            local_key: Some(local_key),
            reference_key: Some(relation.inner_key.clone()),
            duplicate_criteria,
            joined: self.join.is_some(),
        }
    }
}

/// Plan for fetching one root role and its relations.
#[derive(Debug)]
pub struct LoaderTree {
    registry: Arc<SchemaRegistry>,
    loaders: Vec<Loader>,
    conditions: Vec<Condition>,
    order_by: Vec<(ColumnRef, bool)>,
    limit: Option<u64>,
}

impl LoaderTree {
    const ROOT: usize = 0;

    /// Root loader for `role`; its primary key must be a single column.
    #[allow(clippy::result_large_err)]
    pub fn new(registry: Arc<SchemaRegistry>, role: &str) -> Result<Self> {
        let schema = registry.get(role)?;
        if schema.single_primary_key().is_none() {
            return Err(Error::loader(format!(
                "root loader for '{}' needs a single-column primary key, found {:?}",
                role,
                schema.primary_key()
            )));
        }
        Ok(Self::with_root(registry, schema))
    }

    /// Root loader over an already known entity, used for lazy loading.
    pub(crate) fn seeded(registry: Arc<SchemaRegistry>, schema: Arc<EntitySchema>) -> Self {
        Self::with_root(registry, schema)
    }

    fn with_root(registry: Arc<SchemaRegistry>, schema: Arc<EntitySchema>) -> Self {
        Self {
            registry,
            loaders: vec![Loader {
                alias: schema.role().to_string(),
                schema,
                relation: None,
                join: None,
                loads: true,
                parent: None,
                children: Vec::new(),
            }],
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn role(&self) -> &str {
        self.loaders[Self::ROOT].schema.role()
    }

    pub fn root_schema(&self) -> &Arc<EntitySchema> {
        &self.loaders[Self::ROOT].schema
    }

    /// Load the relation at a dotted `path` with `method`.
    ///
    /// Intermediate relations not requested yet are loaded with the same
    /// method. A relation already joined for filtering keeps its join and
    /// loads its data from it.
    #[allow(clippy::result_large_err)]
    pub fn load(&mut self, path: &str, method: LoadMethod) -> Result<()> {
        let mut current = Self::ROOT;
        for segment in split_path(path)? {
            current = match self.child(current, segment) {
                Some(existing) => {
                    self.loaders[existing].loads = true;
                    existing
                }
                None => self.add(current, segment, method.join_type(), true)?,
            };
        }
        tracing::trace!(path, method = method.as_str(), "relation load requested");
        Ok(())
    }

    /// Load the relation at `path`, each newly requested relation with the
    /// method its schema declares, or `fallback` when it declares none.
    #[allow(clippy::result_large_err)]
    pub fn load_preferred(&mut self, path: &str, fallback: LoadMethod) -> Result<()> {
        let mut current = Self::ROOT;
        for segment in split_path(path)? {
            current = match self.child(current, segment) {
                Some(existing) => {
                    self.loaders[existing].loads = true;
                    existing
                }
                None => {
                    let method = self.loaders[current]
                        .schema
                        .relation(segment)
                        .and_then(|r| r.load_method)
                        .unwrap_or(fallback);
                    tracing::trace!(
                        relation = segment,
                        method = method.as_str(),
                        "resolved load method"
                    );
                    self.add(current, segment, method.join_type(), true)?
                }
            };
        }
        Ok(())
    }

    /// Join the relation at `path` for filtering only.
    #[allow(clippy::result_large_err)]
    pub fn with(&mut self, path: &str) -> Result<()> {
        let mut current = Self::ROOT;
        for segment in split_path(path)? {
            current = match self.child(current, segment) {
                Some(existing) => existing,
                None => self.add(current, segment, Some(JoinType::Inner), false)?,
            };
        }
        Ok(())
    }

    fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.loaders[parent]
            .children
            .iter()
            .copied()
            .find(|&c| {
                self.loaders[c]
                    .relation
                    .as_ref()
                    .is_some_and(|(n, _)| n == name)
            })
    }

    #[allow(clippy::result_large_err)]
    fn add(
        &mut self,
        parent: usize,
        name: &str,
        join: Option<JoinType>,
        loads: bool,
    ) -> Result<usize> {
        let owner = &self.loaders[parent];
        let Some(relation) = owner.schema.relation(name).cloned() else {
            return Err(Error::loader(format!(
                "unknown relation '{}' on '{}'",
                name,
                owner.schema.role()
            )));
        };
        if relation.kind == RelationKind::BelongsToMorphed {
            return Err(Error::loader(format!(
                "relation '{}' on '{}' is morphed and loads lazily only",
                name,
                owner.schema.role()
            )));
        }
        // A joined loader below a postload loader joins into that loader's
        // own statement.
        let schema = self.registry.get(relation.target())?;
        let alias = format!("{}_{}", owner.alias, name);
        let id = self.loaders.len();
        self.loaders.push(Loader {
            alias,
            schema,
            relation: Some((name.to_string(), relation)),
            join,
            loads,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.loaders[parent].children.push(id);
        Ok(id)
    }

    /// Resolve `column` or `alias.column` against the root statement.
    /// Unqualified columns bind to the root alias.
    #[allow(clippy::result_large_err)]
    pub fn resolve_column(&self, input: &str) -> Result<ColumnRef> {
        let column = ColumnRef::parse(input)?.or_table(&self.loaders[Self::ROOT].alias);
        let alias = column.table.as_deref().unwrap_or_default();
        let known = self.statement_members(Self::ROOT).into_iter().any(|id| {
            let loader = &self.loaders[id];
            if loader.alias == alias {
                return loader.schema.has_column(&column.column);
            }
            loader.relation().and_then(|r| r.pivot.as_ref()).is_some_and(|pivot| {
                loader.pivot_alias() == alias && pivot.all_columns().contains(&column.column)
            })
        });
        if !known {
            return Err(Error::loader(format!(
                "column '{}' does not belong to the root statement",
                input
            )));
        }
        Ok(column)
    }

    pub fn filter(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn order_by(&mut self, column: ColumnRef, ascending: bool) {
        self.order_by.push((column, ascending));
    }

    pub fn limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    /// Whether the root statement repeats parent rows for joined
    /// collection loaders.
    pub fn has_joined_collections(&self) -> bool {
        self.statement_members(Self::ROOT).into_iter().any(|id| {
            let loader = &self.loaders[id];
            loader.loads && loader.relation().is_some_and(|r| !r.kind.is_singular())
        })
    }

    /// Number of relations requested, joiners included.
    pub fn relation_count(&self) -> usize {
        self.loaders.len() - 1
    }

    /// Loaders sharing the statement headed by `head`, in tree order.
    fn statement_members(&self, head: usize) -> Vec<usize> {
        let mut members = vec![head];
        let mut index = 0;
        while index < members.len() {
            let id = members[index];
            members.extend(
                self.loaders[id]
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| self.loaders[c].join.is_some()),
            );
            index += 1;
        }
        members
    }

    /// Postload loaders directly below the statement headed by `head`.
    fn deferred_children(&self, head: usize) -> Vec<usize> {
        let mut deferred = Vec::new();
        self.collect_deferred(head, &mut deferred);
        deferred
    }

    fn collect_deferred(&self, id: usize, deferred: &mut Vec<usize>) {
        for &child in &self.loaders[id].children {
            let loader = &self.loaders[child];
            if loader.join.is_none() {
                deferred.push(child);
            } else if loader.loads {
                self.collect_deferred(child, deferred);
            }
        }
    }

    /// Fresh node tree mirroring the data-loading loaders.
    #[allow(clippy::result_large_err)]
    pub fn init_node(&self) -> Result<(NodeTree, Vec<Option<NodeId>>)> {
        let mut tree = NodeTree::new(self.loaders[Self::ROOT].node_spec());
        let mut nodes = vec![None; self.loaders.len()];
        nodes[Self::ROOT] = Some(NodeTree::ROOT);
        for (id, loader) in self.loaders.iter().enumerate().skip(1) {
            if !loader.loads {
                continue;
            }
            let parent = loader.parent.and_then(|p| nodes[p]).ok_or_else(|| {
                Error::loader(format!("loader '{}' has no loaded parent", loader.alias))
            })?;
            nodes[id] = Some(tree.add_child(parent, loader.node_spec())?);
        }
        Ok((tree, nodes))
    }

    /// Statement for the root and its joined loaders.
    pub fn root_query(&self) -> SelectQuery {
        let root = &self.loaders[Self::ROOT];
        let mut query = SelectQuery::new(root.schema.table()).alias(root.alias.clone());
        query = self.own_columns(root, query);
        query = self.extend_joined(Self::ROOT, query);
        for condition in &self.conditions {
            query = query.filter(condition.clone());
        }
        for (column, ascending) in &self.order_by {
            query = query.order_by(column.clone(), *ascending);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }

    /// Statement for a postload loader keyed by its parent's values.
    fn deferred_query(&self, id: usize, keys: Vec<Value>) -> SelectQuery {
        let loader = &self.loaders[id];
        let mut query = SelectQuery::new(loader.schema.table()).alias(loader.alias.clone());
        let Some(relation) = loader.relation() else {
            return query;
        };
        match &relation.pivot {
            Some(pivot) if relation.kind == RelationKind::ManyToMany => {
                let pivot_alias = loader.pivot_alias();
                for column in pivot.all_columns() {
                    query = query.column(ColumnRef::new(pivot_alias.clone(), column));
                }
                query = query.join(Join::new(
                    JoinType::Inner,
                    pivot.table.clone(),
                    pivot_alias.clone(),
                    vec![Condition::Columns(
                        ColumnRef::new(pivot_alias.clone(), pivot.outer_key.clone()),
                        ColumnRef::new(loader.alias.clone(), relation.outer_key.clone()),
                    )],
                ));
                query = query.filter(Condition::In(
                    ColumnRef::new(pivot_alias, pivot.inner_key.clone()),
                    keys,
                ));
            }
            _ => {
                query = query.filter(Condition::In(
                    ColumnRef::new(loader.alias.clone(), relation.outer_key.clone()),
                    keys,
                ));
            }
        }
        for (column, value) in &relation.where_eq {
            query = query.filter(Condition::Eq(
                ColumnRef::new(loader.alias.clone(), column.clone()),
                value.clone(),
            ));
        }
        query = self.own_columns(loader, query);
        self.extend_joined(id, query)
    }

    fn own_columns(&self, loader: &Loader, mut query: SelectQuery) -> SelectQuery {
        for column in loader.schema.columns() {
            query = query.column(ColumnRef::new(loader.alias.clone(), column.clone()));
        }
        query
    }

    /// Append the joins of every joined child, and the columns of those that
    /// load data, in node order.
    fn extend_joined(&self, id: usize, mut query: SelectQuery) -> SelectQuery {
        let parent = &self.loaders[id];
        for &child_id in &parent.children {
            let child = &self.loaders[child_id];
            let (Some(join_type), Some(relation)) = (child.join, child.relation()) else {
                continue;
            };
            let mut on_target: Vec<Condition> = Vec::new();
            match &relation.pivot {
                Some(pivot) if relation.kind == RelationKind::ManyToMany => {
                    let pivot_alias = child.pivot_alias();
                    query = query.join(Join::new(
                        join_type,
                        pivot.table.clone(),
                        pivot_alias.clone(),
                        vec![Condition::Columns(
                            ColumnRef::new(pivot_alias.clone(), pivot.inner_key.clone()),
                            ColumnRef::new(parent.alias.clone(), relation.inner_key.clone()),
                        )],
                    ));
                    on_target.push(Condition::Columns(
                        ColumnRef::new(child.alias.clone(), relation.outer_key.clone()),
                        ColumnRef::new(pivot_alias.clone(), pivot.outer_key.clone()),
                    ));
                    if child.loads {
                        for column in pivot.all_columns() {
                            query = query.column(ColumnRef::new(pivot_alias.clone(), column));
                        }
                    }
                }
                _ => on_target.push(Condition::Columns(
                    ColumnRef::new(child.alias.clone(), relation.outer_key.clone()),
                    ColumnRef::new(parent.alias.clone(), relation.inner_key.clone()),
                )),
            }
            for (column, value) in &relation.where_eq {
                on_target.push(Condition::Eq(
                    ColumnRef::new(child.alias.clone(), column.clone()),
                    value.clone(),
                ));
            }
            query = query.join(Join::new(
                join_type,
                child.schema.table(),
                child.alias.clone(),
                on_target,
            ));
            if child.loads {
                query = self.own_columns(child, query);
            }
            query = self.extend_joined(child_id, query);
        }
        query
    }

    /// Run the root statement and every deferred statement below it.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(role = %self.role()))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
    ) -> Outcome<NodeTree, Error> {
        let (mut tree, nodes) = try_outcome!(result: self.init_node());
        let query = self.root_query();
        try_outcome!(run_statement(cx, conn, dialect, &mut tree, NodeTree::ROOT, &query).await);
        try_outcome!(self.load_deferred(cx, conn, dialect, &mut tree, &nodes, Self::ROOT).await);
        Outcome::Ok(tree)
    }

    /// Run only the deferred statements, below a root built from `known`.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, known), fields(role = %self.role()))]
    pub async fn execute_seeded<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        known: &[(String, Value)],
    ) -> Outcome<NodeTree, Error> {
        let (mut tree, nodes) = try_outcome!(result: self.init_node());
        tree.seed(known);
        try_outcome!(self.load_deferred(cx, conn, dialect, &mut tree, &nodes, Self::ROOT).await);
        Outcome::Ok(tree)
    }

    async fn load_deferred<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        tree: &mut NodeTree,
        nodes: &[Option<NodeId>],
        head: usize,
    ) -> Outcome<(), Error> {
        let mut pending: VecDeque<usize> = self.deferred_children(head).into();
        while let Some(id) = pending.pop_front() {
            let loader = &self.loaders[id];
            let (Some(node), Some(parent_node), Some(relation)) = (
                nodes[id],
                loader.parent.and_then(|p| nodes[p]),
                loader.relation(),
            ) else {
                continue;
            };
            let keys = tree.references(parent_node, &relation.inner_key);
            if keys.is_empty() {
                tracing::trace!(alias = %loader.alias, "no parent keys, deferred query skipped");
                continue;
            }
            let query = self.deferred_query(id, keys);
            try_outcome!(run_statement(cx, conn, dialect, tree, node, &query).await);
            for (offset, child) in self.deferred_children(id).into_iter().enumerate() {
                pending.insert(offset, child);
            }
        }
        Outcome::Ok(())
    }
}

async fn run_statement<C: Connection>(
    cx: &Cx,
    conn: &C,
    dialect: Dialect,
    tree: &mut NodeTree,
    node: NodeId,
    query: &SelectQuery,
) -> Outcome<(), Error> {
    let (sql, params) = query.build_with_dialect(dialect);
    tracing::debug!(sql = %sql, params = params.len(), "loader query");
    let mut cursor = try_outcome!(conn.statement(cx, &sql, &params).await);
    for row in cursor.by_ref() {
        if let Err(e) = tree.parse_row_at(node, 0, &row) {
            cursor.close();
            return Outcome::Err(e);
        }
    }
    tracing::trace!(rows = cursor.rows_fetched(), "statement parsed");
    cursor.close();
    Outcome::Ok(())
}

#[allow(clippy::result_large_err)]
fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.trim().split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::loader(format!("invalid relation path '{}'", path)));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ParsedRelation;
    use crate::schema::PivotSchema;
    use crate::test_support::{MockConnection, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new()
            .with(
                EntitySchema::builder("user")
                    .table("users")
                    .primary_key("id")
                    .column("name")
                    .relation("posts", RelationSchema::has_many("post", "id", "user_id"))
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .with(
                EntitySchema::builder("post")
                    .table("posts")
                    .primary_key("id")
                    .column("title")
                    .column("user_id")
                    .relation("author", RelationSchema::belongs_to("user", "user_id", "id"))
                    .relation(
                        "tags",
                        RelationSchema::many_to_many(
                            "tag",
                            "id",
                            "id",
                            PivotSchema::new("post_tags", "post_id", "tag_id").column("weight"),
                        ),
                    )
                    .relation(
                        "target",
                        RelationSchema::belongs_to_morphed(["user"], "user_id", "id", "title"),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .with(
                EntitySchema::builder("tag")
                    .table("tags")
                    .primary_key("id")
                    .column("name")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_load_method_parses_lowercase() {
        let method: LoadMethod = serde_json::from_str("\"inload\"").unwrap();
        assert_eq!(method, LoadMethod::Inload);
        assert!(method.is_joined());
        assert!(!LoadMethod::default().is_joined());
    }

    #[test]
    fn test_joined_loaders_extend_the_root_statement() {
        let mut tree = LoaderTree::new(registry(), "post").unwrap();
        tree.load("author", LoadMethod::Inload).unwrap();
        tree.load("tags", LoadMethod::Join).unwrap();
        let column = tree.resolve_column("post_author.name").unwrap();
        tree.filter(Condition::Eq(column, Value::from("Ann")));

        let (sql, params) = tree.root_query().build();
        assert_eq!(
            sql,
            concat!(
                r#"SELECT "post"."id", "post"."title", "post"."user_id", "post_author"."id", "post_author"."name", "#,
                r#""post_tags_pivot"."post_id", "post_tags_pivot"."tag_id", "post_tags_pivot"."weight", "#,
                r#""post_tags"."id", "post_tags"."name" FROM "posts" AS "post" "#,
                r#"LEFT JOIN "users" AS "post_author" ON "post_author"."id" = "post"."user_id" "#,
                r#"INNER JOIN "post_tags" AS "post_tags_pivot" ON "post_tags_pivot"."post_id" = "post"."id" "#,
                r#"INNER JOIN "tags" AS "post_tags" ON "post_tags"."id" = "post_tags_pivot"."tag_id" "#,
                r#"WHERE "post_author"."name" = $1"#
            )
        );
        assert_eq!(params, vec![Value::from("Ann")]);

        let (node, _) = tree.init_node().unwrap();
        assert_eq!(node.width(NodeTree::ROOT), 10);
    }

    #[test]
    fn test_joiner_filters_without_columns() {
        let mut tree = LoaderTree::new(registry(), "user").unwrap();
        tree.with("posts").unwrap();
        let column = tree.resolve_column("user_posts.title").unwrap();
        tree.filter(Condition::Eq(column, Value::from("x")));
        let (sql, _) = tree.root_query().build();
        assert_eq!(
            sql,
            concat!(
                r#"SELECT "user"."id", "user"."name" FROM "users" AS "user" "#,
                r#"INNER JOIN "posts" AS "user_posts" ON "user_posts"."user_id" = "user"."id" "#,
                r#"WHERE "user_posts"."title" = $1"#
            )
        );
        let (node, _) = tree.init_node().unwrap();
        assert!(node.children(NodeTree::ROOT).is_empty());
    }

    #[test]
    fn test_construction_errors() {
        let registry = registry();
        let mut tree = LoaderTree::new(Arc::clone(&registry), "post").unwrap();
        assert!(matches!(
            tree.load("target", LoadMethod::Postload),
            Err(Error::Loader(_))
        ));
        assert!(matches!(
            tree.load("comments", LoadMethod::Postload),
            Err(Error::Loader(_))
        ));
        assert!(matches!(
            tree.load("author..posts", LoadMethod::Postload),
            Err(Error::Loader(_))
        ));
        assert!(matches!(
            tree.resolve_column("post_author.name"),
            Err(Error::Loader(_))
        ));

        let composite = SchemaRegistry::new()
            .with(
                EntitySchema::builder("link")
                    .primary_key("a")
                    .primary_key("b")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(matches!(
            LoaderTree::new(Arc::new(composite), "link"),
            Err(Error::Loader(_))
        ));
    }

    #[test]
    fn test_postload_issues_in_query_after_root() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.push_rows(
            &["id", "name"],
            vec![
                vec![Value::BigInt(1), Value::from("Ann")],
                vec![Value::BigInt(2), Value::from("Bo")],
            ],
        );
        conn.push_rows(
            &["id", "title", "user_id"],
            vec![
                vec![Value::BigInt(10), Value::from("a"), Value::BigInt(1)],
                vec![Value::BigInt(11), Value::from("b"), Value::BigInt(1)],
            ],
        );

        let mut tree = LoaderTree::new(registry(), "user").unwrap();
        tree.load("posts", LoadMethod::Postload).unwrap();
        let nodes = unwrap_outcome(rt.block_on(tree.execute(&cx, &conn, Dialect::Postgres)));

        let queries = conn.queries();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].0, r#"SELECT "user"."id", "user"."name" FROM "users" AS "user""#);
        assert_eq!(
            queries[1].0,
            concat!(
                r#"SELECT "user_posts"."id", "user_posts"."title", "user_posts"."user_id" FROM "posts" AS "user_posts" "#,
                r#"WHERE "user_posts"."user_id" IN ($1, $2)"#
            )
        );
        assert_eq!(queries[1].1, vec![Value::BigInt(1), Value::BigInt(2)]);

        let records = nodes.result();
        assert_eq!(records[0].relation("posts").map(ParsedRelation::len), Some(2));
        assert_eq!(records[1].relation("posts"), Some(&ParsedRelation::Many(Vec::new())));
    }

    #[test]
    fn test_deferred_query_is_skipped_without_parent_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();

        let mut tree = LoaderTree::new(registry(), "user").unwrap();
        tree.load("posts.tags", LoadMethod::Postload).unwrap();
        let nodes = unwrap_outcome(rt.block_on(tree.execute(&cx, &conn, Dialect::Postgres)));
        assert!(nodes.is_empty());
        assert_eq!(conn.queries().len(), 1);
    }
}
