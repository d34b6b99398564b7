//! Commands: atomic write intents against one table.
//!
//! A [`TableCommand`] is an insert, update, delete or no-op with explicit
//! values, a match predicate and a deferred *context*: column values
//! supplied by other commands at execution time through write-once
//! [`ContextSlot`]s. Commands compose into a [`Command`] tree whose
//! `before`/`after` lists fix the execution order around a primary command.
//!
//! Reactions registered with `on_execute`, `on_complete` and `on_rollback`
//! receive the command after it ran, with its context resolved. Exactly one
//! of complete or rollback fires per command.

use asupersync::{Cx, Outcome};
use relmap_core::query::{Condition, eq_conditions};
use relmap_core::{
    CommandError, CommandErrorKind, Connection, DeleteQuery, Dialect, Error, InsertQuery, Result,
    UpdateQuery, Value,
};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Write-once cell produced by one command and read by its dependents.
#[derive(Clone)]
pub struct ContextSlot {
    label: Arc<str>,
    cell: Arc<OnceLock<Value>>,
}

impl ContextSlot {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// What the slot carries, e.g. `posts.id`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self) -> Option<Value> {
        self.cell.get().cloned()
    }

    /// Fill the slot. Returns `false` if it was already filled.
    pub fn set(&self, value: Value) -> bool {
        self.cell.set(value).is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Check whether two handles refer to the same cell.
    pub fn same_slot(&self, other: &ContextSlot) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("label", &self.label)
            .field("value", &self.cell.get())
            .finish()
    }
}

/// A value known now, or one produced later by another command.
#[derive(Debug, Clone)]
pub enum Bind {
    Value(Value),
    Slot(ContextSlot),
}

impl Bind {
    pub fn resolve(&self) -> Option<Value> {
        match self {
            Bind::Value(value) => Some(value.clone()),
            Bind::Slot(slot) => slot.get(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Bind::Slot(slot) if !slot.is_resolved())
    }
}

impl From<Value> for Bind {
    fn from(value: Value) -> Self {
        Bind::Value(value)
    }
}

impl From<ContextSlot> for Bind {
    fn from(slot: ContextSlot) -> Self {
        Bind::Slot(slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    NoOp,
}

impl CommandKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Insert => "insert into",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete from",
            CommandKind::NoOp => "noop",
        }
    }
}

type Reaction = Box<dyn FnOnce(&TableCommand) + Send>;

#[derive(Debug)]
enum Statement {
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

/// One write against one table.
pub struct TableCommand {
    kind: CommandKind,
    table: String,
    label: String,
    values: Vec<(String, Value)>,
    predicate: Vec<(String, Bind)>,
    context: Vec<(String, Bind)>,
    primary_key: Option<String>,
    insert_slot: Option<ContextSlot>,
    resolved: Vec<(String, Value)>,
    inserted_id: Option<Value>,
    affected: u64,
    on_execute: Vec<Reaction>,
    on_complete: Vec<Reaction>,
    on_rollback: Vec<Reaction>,
}

impl fmt::Debug for TableCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCommand")
            .field("label", &self.label)
            .field("values", &self.values)
            .field("predicate", &self.predicate)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

fn merge_into(base: &mut Vec<(String, Value)>, overrides: &[(String, Value)]) {
    for (column, value) in overrides {
        match base.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value.clone(),
            None => base.push((column.clone(), value.clone())),
        }
    }
}

impl TableCommand {
    fn new(kind: CommandKind, table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            kind,
            label: format!("{} {}", kind.as_str(), table),
            table,
            values: Vec::new(),
            predicate: Vec::new(),
            context: Vec::new(),
            primary_key: None,
            insert_slot: None,
            resolved: Vec::new(),
            inserted_id: None,
            affected: 0,
            on_execute: Vec::new(),
            on_complete: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    /// Insert `values`; when `primary_key` is given the generated id is
    /// published through [`insert_slot`](Self::insert_slot).
    pub fn insert(
        table: impl Into<String>,
        values: Vec<(String, Value)>,
        primary_key: Option<String>,
    ) -> Self {
        let mut command = Self::new(CommandKind::Insert, table);
        command.values = values;
        if let Some(pk) = primary_key {
            command.insert_slot = Some(ContextSlot::new(format!("{}.{}", command.table, pk)));
            command.primary_key = Some(pk);
        }
        command
    }

    /// Conditional update: with no values and no context it runs as a no-op.
    pub fn update(
        table: impl Into<String>,
        values: Vec<(String, Value)>,
        predicate: Vec<(String, Bind)>,
    ) -> Self {
        let mut command = Self::new(CommandKind::Update, table);
        command.values = values;
        command.predicate = predicate;
        command
    }

    pub fn delete(table: impl Into<String>, predicate: Vec<(String, Bind)>) -> Self {
        let mut command = Self::new(CommandKind::Delete, table);
        command.predicate = predicate;
        command
    }

    /// A command that always succeeds without touching storage.
    pub fn noop(table: impl Into<String>) -> Self {
        Self::new(CommandKind::NoOp, table)
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Human-readable label, e.g. `insert into posts`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    pub fn predicate(&self) -> &[(String, Bind)] {
        &self.predicate
    }

    pub fn context(&self) -> &[(String, Bind)] {
        &self.context
    }

    /// Slot receiving the generated identifier of an insert.
    pub fn insert_slot(&self) -> Option<&ContextSlot> {
        self.insert_slot.as_ref()
    }

    /// Context values as merged at execution.
    pub fn resolved_context(&self) -> &[(String, Value)] {
        &self.resolved
    }

    /// Identifier returned by storage for an executed insert.
    pub fn inserted_id(&self) -> Option<&Value> {
        self.inserted_id.as_ref()
    }

    /// Rows affected by an executed update or delete.
    pub fn affected_rows(&self) -> u64 {
        self.affected
    }

    /// Defer `column` to a value supplied at execution; a later bind for
    /// the same column replaces the earlier one. Ignored by no-ops.
    pub fn add_context(&mut self, column: impl Into<String>, bind: impl Into<Bind>) {
        if self.kind == CommandKind::NoOp {
            return;
        }
        let column = column.into();
        let bind = bind.into();
        match self.context.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = bind,
            None => self.context.push((column, bind)),
        }
    }

    /// Check whether `column` is supplied by context.
    pub fn has_context(&self, column: &str) -> bool {
        self.context.iter().any(|(c, _)| c == column)
    }

    pub fn on_execute(&mut self, reaction: impl FnOnce(&TableCommand) + Send + 'static) {
        self.on_execute.push(Box::new(reaction));
    }

    pub fn on_complete(&mut self, reaction: impl FnOnce(&TableCommand) + Send + 'static) {
        self.on_complete.push(Box::new(reaction));
    }

    pub fn on_rollback(&mut self, reaction: impl FnOnce(&TableCommand) + Send + 'static) {
        self.on_rollback.push(Box::new(reaction));
    }

    fn missing_context(&self, column: &str, slot: Option<&ContextSlot>) -> Error {
        let source = slot.map_or_else(|| column.to_string(), |s| s.label().to_string());
        Error::Command(CommandError {
            kind: CommandErrorKind::MissingContext,
            command: self.label.clone(),
            message: format!("context '{}' for column '{}' was never produced", source, column),
            source: None,
        })
    }

    /// UPDATE and DELETE must match on something.
    #[allow(clippy::result_large_err)]
    fn guarded(&self, predicate: &[(String, Value)]) -> Result<Vec<Condition>> {
        if predicate.is_empty() {
            return Err(Error::Command(CommandError {
                kind: CommandErrorKind::MissingPredicate,
                command: self.label.clone(),
                message: format!("refusing to write to '{}' without a predicate", self.table),
                source: None,
            }));
        }
        Ok(eq_conditions(predicate))
    }

    fn failed(&self, err: Error) -> Error {
        Error::Command(CommandError {
            kind: CommandErrorKind::Failed,
            command: self.label.clone(),
            message: String::new(),
            source: Some(Box::new(err)),
        })
    }

    #[allow(clippy::result_large_err)]
    fn resolve_binds(&self, binds: &[(String, Bind)]) -> Result<Vec<(String, Value)>> {
        binds
            .iter()
            .map(|(column, bind)| match bind.resolve() {
                Some(value) => Ok((column.clone(), value)),
                None => Err(self.missing_context(
                    column,
                    match bind {
                        Bind::Slot(slot) => Some(slot),
                        Bind::Value(_) => None,
                    },
                )),
            })
            .collect()
    }

    /// Merge resolved context into values/predicate and describe the
    /// statement; `None` means nothing to write.
    #[allow(clippy::result_large_err)]
    fn prepare(&mut self) -> Result<Option<Statement>> {
        if self.kind == CommandKind::NoOp {
            return Ok(None);
        }
        let context = self.resolve_binds(&self.context)?;
        let mut predicate = self.resolve_binds(&self.predicate)?;
        self.resolved = context.clone();

        match self.kind {
            CommandKind::Insert => {
                let mut values = self.values.clone();
                merge_into(&mut values, &context);
                let mut query = InsertQuery::new(self.table.clone(), values);
                if let Some(pk) = &self.primary_key {
                    query = query.returning(pk.clone());
                }
                Ok(Some(Statement::Insert(query)))
            }
            CommandKind::Update => {
                let mut values = self.values.clone();
                merge_into(&mut values, &context);
                if values.is_empty() {
                    return Ok(None);
                }
                let conditions = self.guarded(&predicate)?;
                Ok(Some(Statement::Update(UpdateQuery::new(
                    self.table.clone(),
                    values,
                    conditions,
                ))))
            }
            CommandKind::Delete => {
                merge_into(&mut predicate, &context);
                let conditions = self.guarded(&predicate)?;
                Ok(Some(Statement::Delete(DeleteQuery::new(
                    self.table.clone(),
                    conditions,
                ))))
            }
            CommandKind::NoOp => Ok(None),
        }
    }

    /// Execute against `conn`. Failures come back wrapped with this
    /// command's label.
    pub(crate) async fn execute<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
    ) -> Outcome<(), Error> {
        let statement = match self.prepare() {
            Ok(statement) => statement,
            Err(e) => return Outcome::Err(e),
        };

        match statement {
            None => {
                tracing::trace!(command = %self.label, "nothing to write");
                Outcome::Ok(())
            }
            Some(Statement::Insert(query)) => {
                let (sql, params) = query.build_with_dialect(dialect);
                tracing::debug!(command = %self.label, sql = %sql, "executing insert");
                match conn.insert(cx, &sql, &params).await {
                    Outcome::Ok(id) => {
                        let id = Value::BigInt(id);
                        if let Some(slot) = &self.insert_slot {
                            slot.set(id.clone());
                        }
                        self.inserted_id = Some(id);
                        Outcome::Ok(())
                    }
                    Outcome::Err(e) => Outcome::Err(self.failed(e)),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            Some(Statement::Update(query)) => {
                let (sql, params) = query.build_with_dialect(dialect);
                self.execute_statement(cx, conn, sql, params).await
            }
            Some(Statement::Delete(query)) => {
                let (sql, params) = query.build_with_dialect(dialect);
                self.execute_statement(cx, conn, sql, params).await
            }
        }
    }

    async fn execute_statement<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        sql: String,
        params: Vec<Value>,
    ) -> Outcome<(), Error> {
        tracing::debug!(command = %self.label, sql = %sql, "executing statement");
        match conn.execute(cx, &sql, &params).await {
            Outcome::Ok(affected) => {
                self.affected = affected;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(self.failed(e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) fn fire_execute(&mut self) {
        for reaction in std::mem::take(&mut self.on_execute) {
            reaction(self);
        }
    }

    pub(crate) fn fire_complete(&mut self) {
        self.on_rollback.clear();
        for reaction in std::mem::take(&mut self.on_complete) {
            reaction(self);
        }
    }

    pub(crate) fn fire_rollback(&mut self) {
        self.on_complete.clear();
        for reaction in std::mem::take(&mut self.on_rollback) {
            reaction(self);
        }
    }
}

/// A primary command wrapped by the commands that must run around it.
///
/// Context and reactions registered on a chain go to its primary.
#[derive(Debug)]
pub enum Command {
    Table(TableCommand),
    Chain {
        before: Vec<Command>,
        primary: Box<Command>,
        after: Vec<Command>,
    },
}

impl From<TableCommand> for Command {
    fn from(command: TableCommand) -> Self {
        Command::Table(command)
    }
}

impl Command {
    pub fn noop(table: impl Into<String>) -> Self {
        Command::Table(TableCommand::noop(table))
    }

    /// The command the chain is built around.
    pub fn primary(&self) -> &TableCommand {
        match self {
            Command::Table(command) => command,
            Command::Chain { primary, .. } => primary.primary(),
        }
    }

    pub fn primary_mut(&mut self) -> &mut TableCommand {
        match self {
            Command::Table(command) => command,
            Command::Chain { primary, .. } => primary.primary_mut(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.primary().kind()
    }

    pub fn label(&self) -> &str {
        self.primary().label()
    }

    pub fn add_context(&mut self, column: impl Into<String>, bind: impl Into<Bind>) {
        self.primary_mut().add_context(column, bind);
    }

    pub fn on_execute(&mut self, reaction: impl FnOnce(&TableCommand) + Send + 'static) {
        self.primary_mut().on_execute(reaction);
    }

    pub fn on_complete(&mut self, reaction: impl FnOnce(&TableCommand) + Send + 'static) {
        self.primary_mut().on_complete(reaction);
    }

    pub fn on_rollback(&mut self, reaction: impl FnOnce(&TableCommand) + Send + 'static) {
        self.primary_mut().on_rollback(reaction);
    }

    fn into_parts(self) -> (Vec<Command>, Command, Vec<Command>) {
        match self {
            Command::Chain {
                before,
                primary,
                after,
            } => (before, *primary, after),
            table @ Command::Table(_) => (Vec::new(), table, Vec::new()),
        }
    }

    /// Run `command` before this one.
    pub fn before(self, command: impl Into<Command>) -> Command {
        let (mut before, primary, after) = self.into_parts();
        before.push(command.into());
        Command::Chain {
            before,
            primary: Box::new(primary),
            after,
        }
    }

    /// Run `command` after this one.
    pub fn after(self, command: impl Into<Command>) -> Command {
        let (before, primary, mut after) = self.into_parts();
        after.push(command.into());
        Command::Chain {
            before,
            primary: Box::new(primary),
            after,
        }
    }

    /// In-place [`before`](Self::before).
    pub fn push_before(&mut self, command: impl Into<Command>) {
        let this = std::mem::replace(self, Command::noop(""));
        *self = this.before(command);
    }

    /// In-place [`after`](Self::after).
    pub fn push_after(&mut self, command: impl Into<Command>) {
        let this = std::mem::replace(self, Command::noop(""));
        *self = this.after(command);
    }

    /// Drop an unqueued tree, firing every rollback reaction in reverse.
    pub(crate) fn discard(self) {
        let mut commands = Vec::new();
        self.flatten(&mut commands);
        for command in commands.iter_mut().rev() {
            command.fire_rollback();
        }
    }

    /// Number of table commands in the tree.
    pub fn table_count(&self) -> usize {
        match self {
            Command::Table(_) => 1,
            Command::Chain {
                before,
                primary,
                after,
            } => {
                before.iter().map(Command::table_count).sum::<usize>()
                    + primary.table_count()
                    + after.iter().map(Command::table_count).sum::<usize>()
            }
        }
    }

    /// Linearize into execution order.
    pub fn flatten(self, out: &mut Vec<TableCommand>) {
        match self {
            Command::Table(command) => out.push(command),
            Command::Chain {
                before,
                primary,
                after,
            } => {
                for command in before {
                    command.flatten(out);
                }
                primary.flatten(out);
                for command in after {
                    command.flatten(out);
                }
            }
        }
    }

    /// Labels of the table commands in execution order.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        self.collect_labels(&mut labels);
        labels
    }

    fn collect_labels(&self, out: &mut Vec<String>) {
        match self {
            Command::Table(command) => out.push(command.label().to_string()),
            Command::Chain {
                before,
                primary,
                after,
            } => {
                for command in before {
                    command.collect_labels(out);
                }
                primary.collect_labels(out);
                for command in after {
                    command.collect_labels(out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_write_once() {
        let slot = ContextSlot::new("users.id");
        assert!(!slot.is_resolved());
        assert!(slot.set(Value::BigInt(1)));
        assert!(!slot.set(Value::BigInt(2)));
        assert_eq!(slot.get(), Some(Value::BigInt(1)));
        assert!(slot.same_slot(&slot.clone()));
        assert!(!slot.same_slot(&ContextSlot::new("users.id")));
    }

    #[test]
    fn test_context_overrides_values() {
        let mut command = TableCommand::insert(
            "posts",
            vec![
                ("title".into(), Value::from("hi")),
                ("user_id".into(), Value::BigInt(1)),
            ],
            Some("id".into()),
        );
        command.add_context("user_id", Value::BigInt(9));
        command.add_context("kind", Value::from("post"));

        let Some(Statement::Insert(query)) = command.prepare().unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(
            query.values,
            vec![
                ("title".to_string(), Value::from("hi")),
                ("user_id".to_string(), Value::BigInt(9)),
                ("kind".to_string(), Value::from("post")),
            ]
        );
        assert_eq!(query.returning.as_deref(), Some("id"));
        assert_eq!(command.resolved_context().len(), 2);
    }

    #[test]
    fn test_empty_update_is_a_noop() {
        let mut command = TableCommand::update(
            "posts",
            Vec::new(),
            vec![("id".into(), Bind::Value(Value::BigInt(3)))],
        );
        assert!(command.prepare().unwrap().is_none());

        command.add_context("user_id", Value::BigInt(4));
        let Some(Statement::Update(query)) = command.prepare().unwrap() else {
            panic!("expected update");
        };
        assert_eq!(query.build().0, r#"UPDATE "posts" SET "user_id" = $1 WHERE "id" = $2"#);
    }

    #[test]
    fn test_delete_context_joins_predicate() {
        let slot = ContextSlot::new("posts.id");
        let mut command =
            TableCommand::delete("post_tags", vec![("tag_id".into(), Value::BigInt(2).into())]);
        command.add_context("post_id", slot.clone());

        let err = command.prepare().unwrap_err();
        assert!(matches!(
            err,
            Error::Command(CommandError {
                kind: CommandErrorKind::MissingContext,
                ..
            })
        ));

        slot.set(Value::BigInt(8));
        let Some(Statement::Delete(query)) = command.prepare().unwrap() else {
            panic!("expected delete");
        };
        assert_eq!(
            query.build().0,
            r#"DELETE FROM "post_tags" WHERE "tag_id" = $1 AND "post_id" = $2"#
        );
    }

    #[test]
    fn test_unguarded_writes_are_rejected() {
        let mut delete = TableCommand::delete("posts", Vec::new());
        match delete.prepare() {
            Err(Error::Command(e)) => {
                assert_eq!(e.kind, CommandErrorKind::MissingPredicate);
                assert_eq!(e.command, "delete from posts");
                assert!(e.source.is_none());
            }
            other => panic!("expected a missing predicate, got {other:?}"),
        }

        let mut update =
            TableCommand::update("posts", vec![("title".into(), Value::from("x"))], Vec::new());
        let err = update.prepare().unwrap_err();
        assert!(err.is_construction_error());
        assert_eq!(err.command(), Some("update posts"));
    }

    #[test]
    fn test_noop_ignores_context() {
        let mut command = TableCommand::noop("users");
        command.add_context("id", Value::BigInt(1));
        assert!(command.context().is_empty());
        assert_eq!(command.label(), "noop users");
    }

    #[test]
    fn test_chain_order_and_delegation() {
        let primary = TableCommand::insert("posts", Vec::new(), Some("id".into()));
        let mut chain = Command::from(primary)
            .before(TableCommand::insert("users", Vec::new(), Some("id".into())))
            .after(TableCommand::insert("comments", Vec::new(), None));
        chain.add_context("user_id", Value::BigInt(1));

        assert_eq!(chain.label(), "insert into posts");
        assert_eq!(chain.table_count(), 3);
        assert_eq!(
            chain.labels(),
            ["insert into users", "insert into posts", "insert into comments"]
        );
        assert!(chain.primary().has_context("user_id"));

        let mut flat = Vec::new();
        chain.flatten(&mut flat);
        assert_eq!(flat[1].table(), "posts");
    }

    #[test]
    fn test_only_one_of_complete_or_rollback_fires() {
        use std::sync::Mutex;

        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut command = TableCommand::noop("users");
        let log = Arc::clone(&fired);
        command.on_complete(move |_| log.lock().unwrap().push("complete"));
        let log = Arc::clone(&fired);
        command.on_rollback(move |_| log.lock().unwrap().push("rollback"));

        command.fire_complete();
        command.fire_rollback();
        assert_eq!(*fired.lock().unwrap(), vec!["complete"]);
    }
}
