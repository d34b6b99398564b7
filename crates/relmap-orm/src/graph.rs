//! Command graph: the unit of work of one save.
//!
//! Commands execute strictly in enqueue order inside one transaction.
//! `on_execute` reactions fire right after each command; once every command
//! ran and the transaction committed, `on_complete` fires for all of them in
//! order. Any failure rolls the transaction back and fires `on_rollback` for
//! every enqueued command in reverse order instead.

use crate::command::{Command, TableCommand};
use crate::entity::EntityRef;
use asupersync::{Cx, Outcome};
use relmap_core::{Connection, Dialect, Error, Result};

/// Ordered set of commands executed as one all-or-nothing batch.
#[derive(Debug, Default)]
pub struct CommandGraph {
    commands: Vec<TableCommand>,
    dialect: Option<Dialect>,
}

impl CommandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render SQL with `dialect` instead of the connection's.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }

    /// Append a command (and everything chained around it).
    pub fn enqueue(&mut self, command: impl Into<Command>) {
        command.into().flatten(&mut self.commands);
    }

    /// Queue the store of `entity`, optionally with its relations.
    #[allow(clippy::result_large_err)]
    pub fn store(&mut self, entity: &EntityRef, with_relations: bool) -> Result<()> {
        let command = entity.queue_store(with_relations)?;
        self.enqueue(command);
        Ok(())
    }

    /// Queue the delete of `entity`.
    #[allow(clippy::result_large_err)]
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        let command = entity.queue_delete()?;
        self.enqueue(command);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Labels in execution order.
    pub fn labels(&self) -> Vec<&str> {
        self.commands.iter().map(TableCommand::label).collect()
    }

    /// Discard the graph without running it.
    pub fn rollback(mut self) {
        tracing::debug!(commands = self.commands.len(), "discarding command graph");
        Self::fire_rollback(&mut self.commands);
    }

    fn fire_rollback(commands: &mut [TableCommand]) {
        for command in commands.iter_mut().rev() {
            command.fire_rollback();
        }
    }

    async fn abort<C: Connection>(commands: &mut [TableCommand], cx: &Cx, conn: &C) {
        match conn.rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "transaction rollback failed");
            }
            Outcome::Cancelled(_) => {
                tracing::warn!("transaction rollback cancelled");
            }
            Outcome::Panicked(_) => {
                tracing::warn!("transaction rollback panicked");
            }
        }
        Self::fire_rollback(commands);
    }

    /// Execute every command in one transaction.
    ///
    /// On failure, cancellation or panic the transaction is rolled back and
    /// every enqueued command gets its rollback reaction exactly once, in
    /// reverse order, including commands that never executed. Each entity
    /// touched by the graph therefore reverts to its state before `store`.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(commands = self.commands.len()))]
    pub async fn run<C: Connection>(mut self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        if self.commands.is_empty() {
            return Outcome::Ok(());
        }
        let dialect = self.dialect.unwrap_or_else(|| conn.dialect());

        match conn.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                Self::fire_rollback(&mut self.commands);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                Self::fire_rollback(&mut self.commands);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                Self::fire_rollback(&mut self.commands);
                return Outcome::Panicked(p);
            }
        }

        for index in 0..self.commands.len() {
            let outcome = self.commands[index].execute(cx, conn, dialect).await;
            match outcome {
                Outcome::Ok(()) => self.commands[index].fire_execute(),
                Outcome::Err(e) => {
                    tracing::debug!(command = %self.commands[index].label(), error = %e, "command failed");
                    Self::abort(&mut self.commands, cx, conn).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    Self::abort(&mut self.commands, cx, conn).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    Self::abort(&mut self.commands, cx, conn).await;
                    return Outcome::Panicked(p);
                }
            }
        }

        match conn.commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                Self::abort(&mut self.commands, cx, conn).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                Self::abort(&mut self.commands, cx, conn).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                Self::abort(&mut self.commands, cx, conn).await;
                return Outcome::Panicked(p);
            }
        }

        for command in &mut self.commands {
            command.fire_complete();
        }
        tracing::debug!(commands = self.commands.len(), "command graph complete");
        Outcome::Ok(())
    }
}
