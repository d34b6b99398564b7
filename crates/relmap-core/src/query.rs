//! Abstract query descriptions and their SQL rendering.
//!
//! The ORM describes every statement as one of [`SelectQuery`],
//! [`InsertQuery`], [`UpdateQuery`] or [`DeleteQuery`]; rendering to SQL
//! text happens only at the connection boundary via `build_with_dialect`.

use crate::Result;
use crate::identifiers::validate_identifier;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Every table, alias and column is quoted, so reserved words such as
    /// `user` or `order` are safe as names.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{escaped}\"")
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{escaped}`")
            }
        }
    }

    /// Check if this dialect supports `INSERT ... RETURNING`.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// A column, optionally qualified by a table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    /// Column qualified by a table alias.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }

    /// Unqualified column.
    pub fn bare(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    /// Parse `column` or `alias.column`, validating both parts.
    #[allow(clippy::result_large_err)]
    pub fn parse(input: &str) -> Result<Self> {
        match input.split_once('.') {
            Some((table, column)) => {
                validate_identifier("table alias", table)?;
                validate_identifier("column", column)?;
                Ok(Self::new(table, column))
            }
            None => {
                validate_identifier("column", input)?;
                Ok(Self::bare(input))
            }
        }
    }

    /// Render as quoted SQL for `dialect`.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        match &self.table {
            Some(table) => format!(
                "{}.{}",
                dialect.quote_identifier(table),
                dialect.quote_identifier(&self.column)
            ),
            None => dialect.quote_identifier(&self.column),
        }
    }

    /// Qualify an unqualified column with `alias`.
    pub fn or_table(mut self, alias: &str) -> Self {
        if self.table.is_none() {
            self.table = Some(alias.to_string());
        }
        self
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

/// A single predicate; predicates in a WHERE or ON list are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value` (`IS NULL` when the value is NULL)
    Eq(ColumnRef, Value),
    /// `column IN (values)`; an empty list matches nothing
    In(ColumnRef, Vec<Value>),
    /// `column IS NULL`
    IsNull(ColumnRef),
    /// `left = right`, used for join conditions
    Columns(ColumnRef, ColumnRef),
}

/// Types of SQL joins used by loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub alias: String,
    pub on: Vec<Condition>,
}

impl Join {
    pub fn new(
        join_type: JoinType,
        table: impl Into<String>,
        alias: impl Into<String>,
        on: Vec<Condition>,
    ) -> Self {
        Self {
            join_type,
            table: table.into(),
            alias: alias.into(),
            on,
        }
    }
}

/// ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub ascending: bool,
}

struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn column(&self, column: &ColumnRef) -> String {
        column.to_sql(self.dialect)
    }

    fn bind(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        self.dialect.placeholder(self.params.len())
    }

    fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::Eq(column, value) if value.is_null() => {
                format!("{} IS NULL", self.column(column))
            }
            Condition::Eq(column, value) => {
                let placeholder = self.bind(value);
                format!("{} = {placeholder}", self.column(column))
            }
            Condition::In(_, values) if values.is_empty() => "1 = 0".to_string(),
            Condition::In(column, values) => {
                let placeholders: Vec<_> = values.iter().map(|v| self.bind(v)).collect();
                format!("{} IN ({})", self.column(column), placeholders.join(", "))
            }
            Condition::IsNull(column) => format!("{} IS NULL", self.column(column)),
            Condition::Columns(left, right) => {
                format!("{} = {}", self.column(left), self.column(right))
            }
        }
    }

    fn conditions(&mut self, keyword: &str, conditions: &[Condition]) {
        if conditions.is_empty() {
            return;
        }
        let rendered: Vec<_> = conditions.iter().map(|c| self.condition(c)).collect();
        self.sql.push_str(keyword);
        self.sql.push_str(&rendered.join(" AND "));
    }

    fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

/// SELECT description consumed by loaders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub alias: Option<String>,
    pub columns: Vec<ColumnRef>,
    pub joins: Vec<Join>,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    /// Create a new SELECT over `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Alias the base table.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Append a selected column.
    pub fn column(mut self, column: ColumnRef) -> Self {
        self.columns.push(column);
        self
    }

    /// Append a JOIN clause.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Add a WHERE condition (AND-ed with existing ones).
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add an ORDER BY term.
    pub fn order_by(mut self, column: ColumnRef, ascending: bool) -> Self {
        self.order_by.push(OrderBy { column, ascending });
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Build the SELECT SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the SELECT SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut w = SqlWriter::new(dialect);
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| w.column(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        w.sql = format!("SELECT {} FROM {}", columns, w.quote(&self.table));
        if let Some(alias) = &self.alias {
            let alias = w.quote(alias);
            w.sql.push_str(&format!(" AS {alias}"));
        }
        for join in &self.joins {
            let on: Vec<_> = join.on.iter().map(|c| w.condition(c)).collect();
            let clause = format!(
                " {} {} AS {} ON {}",
                join.join_type.as_str(),
                w.quote(&join.table),
                w.quote(&join.alias),
                on.join(" AND ")
            );
            w.sql.push_str(&clause);
        }
        w.conditions(" WHERE ", &self.conditions);
        if !self.order_by.is_empty() {
            let terms: Vec<_> = self
                .order_by
                .iter()
                .map(|o| {
                    let direction = if o.ascending { "ASC" } else { "DESC" };
                    format!("{} {direction}", w.column(&o.column))
                })
                .collect();
            w.sql.push_str(" ORDER BY ");
            w.sql.push_str(&terms.join(", "));
        }
        if let Some(limit) = self.limit {
            w.sql.push_str(&format!(" LIMIT {limit}"));
        }
        w.finish()
    }
}

/// INSERT description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertQuery {
    pub table: String,
    pub values: Vec<(String, Value)>,
    /// Column whose generated value the statement should hand back.
    pub returning: Option<String>,
}

impl InsertQuery {
    pub fn new(table: impl Into<String>, values: Vec<(String, Value)>) -> Self {
        Self {
            table: table.into(),
            values,
            returning: None,
        }
    }

    /// Ask for the generated value of `column`.
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    /// Build the INSERT SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the INSERT SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut w = SqlWriter::new(dialect);
        let table = w.quote(&self.table);
        if self.values.is_empty() {
            w.sql = match dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                Dialect::Postgres | Dialect::Sqlite => {
                    format!("INSERT INTO {table} DEFAULT VALUES")
                }
            };
        } else {
            let columns: Vec<_> = self.values.iter().map(|(c, _)| w.quote(c)).collect();
            let placeholders: Vec<_> = self.values.iter().map(|(_, v)| w.bind(v)).collect();
            w.sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
        }
        if let Some(column) = &self.returning {
            if dialect.supports_returning() {
                let column = w.quote(column);
                w.sql.push_str(&format!(" RETURNING {column}"));
            }
        }
        w.finish()
    }
}

/// UPDATE description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateQuery {
    pub table: String,
    pub values: Vec<(String, Value)>,
    pub conditions: Vec<Condition>,
}

impl UpdateQuery {
    pub fn new(
        table: impl Into<String>,
        values: Vec<(String, Value)>,
        conditions: Vec<Condition>,
    ) -> Self {
        Self {
            table: table.into(),
            values,
            conditions,
        }
    }

    /// Build the UPDATE SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the UPDATE SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut w = SqlWriter::new(dialect);
        let set: Vec<_> = self
            .values
            .iter()
            .map(|(column, value)| {
                let placeholder = w.bind(value);
                format!("{} = {placeholder}", w.quote(column))
            })
            .collect();
        w.sql = format!("UPDATE {} SET {}", w.quote(&self.table), set.join(", "));
        w.conditions(" WHERE ", &self.conditions);
        w.finish()
    }
}

/// DELETE description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteQuery {
    pub table: String,
    pub conditions: Vec<Condition>,
}

impl DeleteQuery {
    pub fn new(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            table: table.into(),
            conditions,
        }
    }

    /// Build the DELETE SQL and parameters with default dialect (Postgres).
    pub fn build(&self) -> (String, Vec<Value>) {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the DELETE SQL and parameters with specific dialect.
    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut w = SqlWriter::new(dialect);
        w.sql = format!("DELETE FROM {}", w.quote(&self.table));
        w.conditions(" WHERE ", &self.conditions);
        w.finish()
    }
}

/// Build equality conditions on unqualified columns.
pub fn eq_conditions(pairs: &[(String, Value)]) -> Vec<Condition> {
    pairs
        .iter()
        .map(|(column, value)| Condition::Eq(ColumnRef::bare(column.clone()), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(2), "?");
    }

    #[test]
    fn test_select_with_join_and_filters() {
        let query = SelectQuery::new("users")
            .alias("user")
            .column(ColumnRef::new("user", "id"))
            .column(ColumnRef::new("user_posts", "id"))
            .join(Join::new(
                JoinType::Left,
                "posts",
                "user_posts",
                vec![Condition::Columns(
                    ColumnRef::new("user_posts", "user_id"),
                    ColumnRef::new("user", "id"),
                )],
            ))
            .filter(Condition::Eq(ColumnRef::new("user", "name"), Value::from("Ann")))
            .filter(Condition::In(
                ColumnRef::new("user", "id"),
                vec![Value::BigInt(1), Value::BigInt(2)],
            ))
            .order_by(ColumnRef::new("user", "id"), false)
            .limit(5);

        let (sql, params) = query.build();
        assert_eq!(
            sql,
            concat!(
                r#"SELECT "user"."id", "user_posts"."id" FROM "users" AS "user" "#,
                r#"LEFT JOIN "posts" AS "user_posts" ON "user_posts"."user_id" = "user"."id" "#,
                r#"WHERE "user"."name" = $1 AND "user"."id" IN ($2, $3) "#,
                r#"ORDER BY "user"."id" DESC LIMIT 5"#
            )
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_null_and_empty_in_conditions() {
        let query = SelectQuery::new("posts")
            .filter(Condition::Eq(ColumnRef::bare("user_id"), Value::Null))
            .filter(Condition::In(ColumnRef::bare("id"), Vec::new()));
        let (sql, params) = query.build_with_dialect(Dialect::Sqlite);
        assert_eq!(sql, r#"SELECT * FROM "posts" WHERE "user_id" IS NULL AND 1 = 0"#);
        assert!(params.is_empty());
    }

    #[test]
    fn test_insert_rendering() {
        let insert = InsertQuery::new("posts", vec![("title".into(), Value::from("hi"))])
            .returning("id");
        let (sql, params) = insert.build();
        assert_eq!(sql, r#"INSERT INTO "posts" ("title") VALUES ($1) RETURNING "id""#);
        assert_eq!(params, vec![Value::from("hi")]);

        let (sql, _) = insert.build_with_dialect(Dialect::Mysql);
        assert_eq!(sql, "INSERT INTO `posts` (`title`) VALUES (?)");

        let (sql, _) = InsertQuery::new("tags", Vec::new()).build();
        assert_eq!(sql, r#"INSERT INTO "tags" DEFAULT VALUES"#);
    }

    #[test]
    fn test_update_and_delete_rendering() {
        let update = UpdateQuery::new(
            "posts",
            vec![("title".into(), Value::from("new"))],
            eq_conditions(&[("id".into(), Value::BigInt(7))]),
        );
        let (sql, params) = update.build_with_dialect(Dialect::Sqlite);
        assert_eq!(sql, r#"UPDATE "posts" SET "title" = ?1 WHERE "id" = ?2"#);
        assert_eq!(params, vec![Value::from("new"), Value::BigInt(7)]);

        let delete = DeleteQuery::new("posts", eq_conditions(&[("id".into(), Value::BigInt(7))]));
        assert_eq!(delete.build().0, r#"DELETE FROM "posts" WHERE "id" = $1"#);
    }

    #[test]
    fn test_reserved_words_are_quoted_per_dialect() {
        let query = SelectQuery::new("order")
            .alias("user")
            .column(ColumnRef::new("user", "select"))
            .filter(Condition::Eq(ColumnRef::new("user", "group"), Value::BigInt(1)));
        assert_eq!(
            query.build().0,
            r#"SELECT "user"."select" FROM "order" AS "user" WHERE "user"."group" = $1"#
        );
        assert_eq!(
            query.build_with_dialect(Dialect::Mysql).0,
            "SELECT `user`.`select` FROM `order` AS `user` WHERE `user`.`group` = ?"
        );

        assert_eq!(Dialect::Sqlite.quote_identifier("a\"b"), r#""a""b""#);
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
        assert_eq!(
            ColumnRef::new("user", "id").to_sql(Dialect::Postgres),
            r#""user"."id""#
        );
    }

    #[test]
    fn test_column_ref_parsing() {
        assert_eq!(
            ColumnRef::parse("post.title").unwrap(),
            ColumnRef::new("post", "title")
        );
        let bare = ColumnRef::parse("title").unwrap();
        assert_eq!(bare.clone().or_table("post").to_string(), "post.title");
        assert!(ColumnRef::parse("title; drop").is_err());
    }

    #[test]
    fn test_dialect_from_config() {
        let dialect: Dialect = serde_json::from_str("\"sqlite\"").unwrap();
        assert_eq!(dialect, Dialect::Sqlite);
    }
}
