//! Database connection traits.
//!
//! This module defines the narrow storage collaborator consumed by the ORM:
//!
//! - [`Connection`] - statement execution plus transaction boundaries
//! - [`Cursor`] - forward-only row cursor with an explicit `close()`
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! for proper cancellation and timeout handling. A round trip is the only
//! suspension point of a command graph or a loader traversal.

use crate::query::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A database connection capable of executing statements.
///
/// All operations are async and take a `Cx` context for cancellation/timeout support.
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// # Transaction Support
///
/// [`begin`](Connection::begin), [`commit`](Connection::commit) and
/// [`rollback`](Connection::rollback) wrap exactly one command graph
/// execution. The ORM never nests transactions.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM users WHERE id = $1", &[Value::BigInt(1)]).await;
///
/// conn.begin(&cx).await;
/// let id = conn.insert(&cx, "INSERT INTO users (name) VALUES ($1)", &[Value::from("Ann")]).await;
/// conn.commit(&cx).await;
/// ```
pub trait Connection: Send + Sync {
    /// SQL dialect used to render statements for this connection.
    fn dialect(&self) -> Dialect {
        Dialect::default()
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the storage-assigned identifier.
    ///
    /// For PostgreSQL, this typically uses RETURNING to get the inserted ID.
    /// The exact behavior depends on the driver implementation.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Execute a query and hand the rows back through a forward-only cursor.
    fn statement(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Cursor, crate::Error>> + Send {
        async move {
            match self.query(cx, sql, params).await {
                Outcome::Ok(rows) => Outcome::Ok(Cursor::new(rows)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}

/// Forward-only cursor over the rows of one statement.
///
/// Rows are handed out once, in the order the database produced them.
/// After [`close`](Cursor::close) the cursor yields nothing.
#[derive(Debug)]
pub struct Cursor {
    rows: std::vec::IntoIter<Row>,
    fetched: usize,
    closed: bool,
}

impl Cursor {
    /// Wrap a fetched result set.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
            fetched: 0,
            closed: false,
        }
    }

    /// Number of rows consumed so far.
    pub fn rows_fetched(&self) -> usize {
        self.fetched
    }

    /// Check whether the cursor was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the remaining rows.
    pub fn close(&mut self) {
        let discarded = self.rows.len();
        self.closed = true;
        self.rows = Vec::new().into_iter();
        tracing::trace!(fetched = self.fetched, discarded, "cursor closed");
    }
}

impl Iterator for Cursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        if self.closed {
            return None;
        }
        let row = self.rows.next()?;
        self.fetched += 1;
        Some(row)
    }
}
