//! Entity and relation schemas.
//!
//! A schema describes one role: the table it lives in, its columns and
//! primary key, and the relations it declares. Schemas are built once,
//! validated at construction and shared behind `Arc`.

use crate::loader::LoadMethod;
use relmap_core::{Error, Result, Value, validate_identifier};
use std::collections::HashMap;
use std::sync::Arc;

/// The closed set of relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// The owner holds the foreign key (`posts.user_id -> users.id`).
    BelongsTo,
    /// The target holds the foreign key, at most one target.
    HasOne,
    /// The target holds the foreign key, any number of targets.
    HasMany,
    /// Targets are linked through a pivot table.
    ManyToMany,
    /// Belongs-to whose target role is read from a morph key column.
    BelongsToMorphed,
}

impl RelationKind {
    /// Get the declaration name of this relation kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelationKind::BelongsTo => "belongs_to",
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
            RelationKind::ManyToMany => "many_to_many",
            RelationKind::BelongsToMorphed => "belongs_to_morphed",
        }
    }

    /// Relations holding a single related entity.
    pub const fn is_singular(&self) -> bool {
        matches!(
            self,
            RelationKind::BelongsTo | RelationKind::HasOne | RelationKind::BelongsToMorphed
        )
    }
}

/// Association table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotSchema {
    pub table: String,
    /// Pivot column referencing the owner (`post_tags.post_id`).
    pub inner_key: String,
    /// Pivot column referencing the target (`post_tags.tag_id`).
    pub outer_key: String,
    /// Extra pivot columns beyond the two keys.
    pub columns: Vec<String>,
    /// Values written into newly linked pivot rows unless overridden.
    pub defaults: Vec<(String, Value)>,
}

impl PivotSchema {
    pub fn new(
        table: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            inner_key: inner_key.into(),
            outer_key: outer_key.into(),
            columns: Vec::new(),
            defaults: Vec::new(),
        }
    }

    /// Declare an extra pivot column.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(name.into());
        self
    }

    /// Declare a default value for an extra pivot column.
    pub fn default_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !self.columns.contains(&name) {
            self.columns.push(name.clone());
        }
        self.defaults.push((name, value.into()));
        self
    }

    /// All pivot columns in selection order: both keys, then the extras.
    pub fn all_columns(&self) -> Vec<String> {
        let mut columns = vec![self.inner_key.clone(), self.outer_key.clone()];
        columns.extend(self.columns.iter().cloned());
        columns
    }
}

/// Declaration of one relation.
///
/// `inner_key` always names a column of the owning role and `outer_key` a
/// column of the target role, whatever side holds the foreign key.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSchema {
    pub kind: RelationKind,
    pub targets: Vec<String>,
    pub inner_key: String,
    pub outer_key: String,
    pub nullable: bool,
    pub where_eq: Vec<(String, Value)>,
    pub load_method: Option<LoadMethod>,
    pub pivot: Option<PivotSchema>,
    pub morph_key: Option<String>,
}

impl RelationSchema {
    fn new(
        kind: RelationKind,
        targets: Vec<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            targets,
            inner_key: inner_key.into(),
            outer_key: outer_key.into(),
            nullable: true,
            where_eq: Vec::new(),
            load_method: None,
            pivot: None,
            morph_key: None,
        }
    }

    pub fn belongs_to(
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self::new(RelationKind::BelongsTo, vec![target.into()], inner_key, outer_key)
    }

    pub fn has_one(
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self::new(RelationKind::HasOne, vec![target.into()], inner_key, outer_key)
    }

    pub fn has_many(
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self::new(RelationKind::HasMany, vec![target.into()], inner_key, outer_key)
    }

    pub fn many_to_many(
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
        pivot: PivotSchema,
    ) -> Self {
        let mut relation =
            Self::new(RelationKind::ManyToMany, vec![target.into()], inner_key, outer_key);
        relation.pivot = Some(pivot);
        relation
    }

    /// Belongs-to over several possible target roles; `morph_key` stores
    /// the role of the current target.
    pub fn belongs_to_morphed<I, S>(
        targets: I,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
        morph_key: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets = targets.into_iter().map(Into::into).collect();
        let mut relation =
            Self::new(RelationKind::BelongsToMorphed, targets, inner_key, outer_key);
        relation.morph_key = Some(morph_key.into());
        relation
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Pre-defined condition on the target, applied to lazy and eager
    /// selections and written into newly attached has-many members.
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_eq.push((column.into(), value.into()));
        self
    }

    pub fn load_method(mut self, method: LoadMethod) -> Self {
        self.load_method = Some(method);
        self
    }

    /// Target role of a non-morphed relation.
    pub fn target(&self) -> &str {
        self.targets.first().map_or("", String::as_str)
    }

    /// Check whether `role` is an acceptable related entity.
    pub fn accepts(&self, role: &str) -> bool {
        self.targets.iter().any(|t| t == role)
    }
}

/// Schema of one entity role.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    role: String,
    table: String,
    primary_key: Vec<String>,
    columns: Vec<String>,
    defaults: Vec<(String, Value)>,
    persist_all_fields: bool,
    relations: Vec<(String, RelationSchema)>,
}

impl EntitySchema {
    pub fn builder(role: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder::new(role.into())
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// The primary key column when the key is a single column.
    pub fn single_primary_key(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [pk] => Some(pk),
            _ => None,
        }
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == column)
    }

    /// All columns, primary key included, in declaration order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    /// Default value of a column for freshly made entities.
    pub fn default_for(&self, column: &str) -> Value {
        self.defaults
            .iter()
            .find(|(c, _)| c == column)
            .map_or(Value::Null, |(_, v)| v.clone())
    }

    pub fn persist_all_fields(&self) -> bool {
        self.persist_all_fields
    }

    pub fn relations(&self) -> &[(String, RelationSchema)] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationSchema> {
        self.relations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn relation_index(&self, name: &str) -> Option<usize> {
        self.relations.iter().position(|(n, _)| n == name)
    }
}

/// Builder for [`EntitySchema`]; identifiers are checked in `build`.
#[derive(Debug)]
pub struct EntitySchemaBuilder {
    role: String,
    table: Option<String>,
    primary_key: Vec<String>,
    columns: Vec<String>,
    defaults: Vec<(String, Value)>,
    persist_all_fields: bool,
    relations: Vec<(String, RelationSchema)>,
}

impl EntitySchemaBuilder {
    fn new(role: String) -> Self {
        Self {
            role,
            table: None,
            primary_key: Vec::new(),
            columns: Vec::new(),
            defaults: Vec::new(),
            persist_all_fields: false,
            relations: Vec::new(),
        }
    }

    /// Table name; defaults to the role.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Add a primary key column (repeat for composite keys).
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if !self.columns.contains(&column) {
            self.columns.push(column.clone());
        }
        self.primary_key.push(column);
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if !self.columns.contains(&column) {
            self.columns.push(column);
        }
        self
    }

    pub fn column_default(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let column = column.into();
        if !self.columns.contains(&column) {
            self.columns.push(column.clone());
        }
        self.defaults.push((column, value.into()));
        self
    }

    /// Write every field on update instead of only the changed ones.
    pub fn persist_all_fields(mut self, enabled: bool) -> Self {
        self.persist_all_fields = enabled;
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: RelationSchema) -> Self {
        self.relations.push((name.into(), relation));
        self
    }

    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<EntitySchema> {
        let table = self.table.unwrap_or_else(|| self.role.clone());
        validate_identifier("role", &self.role)?;
        validate_identifier("table", &table)?;
        for column in &self.columns {
            validate_identifier("column", column)?;
        }

        for (name, relation) in &self.relations {
            validate_identifier("relation", name)?;
            if self
                .relations
                .iter()
                .filter(|(other, _)| other == name)
                .count()
                > 1
            {
                return Err(Error::config(format!(
                    "relation '{}' is declared twice on role '{}'",
                    name, self.role
                )));
            }
            if relation.targets.is_empty() {
                return Err(Error::relation(name.clone(), "relation has no target role"));
            }
            for target in &relation.targets {
                validate_identifier("role", target)?;
            }
            validate_identifier("column", &relation.inner_key)?;
            validate_identifier("column", &relation.outer_key)?;
            if !self.columns.contains(&relation.inner_key) {
                return Err(Error::relation(
                    name.clone(),
                    format!(
                        "inner key '{}' is not a column of role '{}'",
                        relation.inner_key, self.role
                    ),
                ));
            }
            if let Some(morph_key) = &relation.morph_key {
                if !self.columns.contains(morph_key) {
                    return Err(Error::relation(
                        name.clone(),
                        format!(
                            "morph key '{}' is not a column of role '{}'",
                            morph_key, self.role
                        ),
                    ));
                }
            }
            if let Some(pivot) = &relation.pivot {
                validate_identifier("table", &pivot.table)?;
                for column in pivot.all_columns() {
                    validate_identifier("column", &column)?;
                }
            }
            for (column, _) in &relation.where_eq {
                validate_identifier("column", column)?;
            }
        }

        Ok(EntitySchema {
            role: self.role,
            table,
            primary_key: self.primary_key,
            columns: self.columns,
            defaults: self.defaults,
            persist_all_fields: self.persist_all_fields,
            relations: self.relations,
        })
    }
}

/// Role → schema lookup shared by the ORM.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Relation targets may be registered later;
    /// [`validate`](Self::validate) checks them once all roles are known.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, schema: EntitySchema) -> Result<Arc<EntitySchema>> {
        if self.schemas.contains_key(schema.role()) {
            return Err(Error::config(format!(
                "role '{}' is already registered",
                schema.role()
            )));
        }
        let schema = Arc::new(schema);
        self.schemas
            .insert(schema.role().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Builder-style [`register`](Self::register).
    #[allow(clippy::result_large_err)]
    pub fn with(mut self, schema: EntitySchema) -> Result<Self> {
        self.register(schema)?;
        Ok(self)
    }

    #[allow(clippy::result_large_err)]
    pub fn get(&self, role: &str) -> Result<Arc<EntitySchema>> {
        self.schemas
            .get(role)
            .cloned()
            .ok_or_else(|| Error::record(role, "unknown role"))
    }

    pub fn contains(&self, role: &str) -> bool {
        self.schemas.contains_key(role)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Verify that every relation points at registered roles and columns.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        for schema in self.schemas.values() {
            for (name, relation) in schema.relations() {
                for target in &relation.targets {
                    let target_schema = self.schemas.get(target).ok_or_else(|| {
                        Error::relation(
                            format!("{}.{}", schema.role(), name),
                            format!("target role '{}' is not registered", target),
                        )
                    })?;
                    if !target_schema.has_column(&relation.outer_key) {
                        return Err(Error::relation(
                            format!("{}.{}", schema.role(), name),
                            format!(
                                "outer key '{}' is not a column of role '{}'",
                                relation.outer_key, target
                            ),
                        ));
                    }
                    if relation.kind != RelationKind::BelongsTo
                        && relation.kind != RelationKind::BelongsToMorphed
                        && target_schema.primary_key().is_empty()
                    {
                        return Err(Error::relation(
                            format!("{}.{}", schema.role(), name),
                            format!("target role '{}' has no primary key", target),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
