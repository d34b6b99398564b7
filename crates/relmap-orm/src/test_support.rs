//! In-memory connection for tests.
//!
//! Built for this crate's unit tests and, with the `test-support` feature,
//! for the integration tests of crates on top of it.
#![allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures

use asupersync::{Cx, Outcome};
use relmap_core::{Connection, Dialect, Error, Row, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Default)]
struct MockState {
    statements: Vec<(String, Vec<Value>)>,
    writes: Vec<(String, Vec<Value>)>,
    queries: Vec<(String, Vec<Value>)>,
    results: VecDeque<Vec<Row>>,
    next_insert_id: i64,
    fail_write: Option<usize>,
}

/// Records every statement, hands out sequential insert ids and serves
/// queued result sets in query order.
#[derive(Clone)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_insert_id: 1,
                ..MockState::default()
            })),
            dialect: Dialect::Postgres,
        }
    }

    /// Ids handed out by inserts start at `id` and increase by one.
    pub fn set_next_insert_id(&self, id: i64) {
        self.state.lock().unwrap().next_insert_id = id;
    }

    /// Render statements for `dialect` instead of Postgres.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Make the `n`-th write (1-based) fail with a unique violation.
    pub fn fail_write(&self, n: usize) {
        self.state.lock().unwrap().fail_write = Some(n);
    }

    /// Queue the result set of the next query.
    pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let names: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|values| Row::new(names.clone(), values))
            .collect();
        self.state.lock().unwrap().results.push_back(rows);
    }

    /// Every statement in order, including `BEGIN`, `COMMIT` and `ROLLBACK`.
    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn writes(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes.len()
    }

    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().queries.clone()
    }

    #[allow(clippy::result_large_err)]
    fn record_write(&self, sql: &str, params: &[Value]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.statements.push((sql.to_string(), params.to_vec()));
        state.writes.push((sql.to_string(), params.to_vec()));
        if state.fail_write == Some(state.writes.len()) {
            return Err(Error::from_sqlstate(
                "23505",
                "duplicate key value violates unique constraint",
            ));
        }
        Ok(())
    }

    fn record_marker(&self, marker: &str) {
        self.state
            .lock()
            .unwrap()
            .statements
            .push((marker.to_string(), Vec::new()));
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let rows = {
            let mut state = self.state.lock().unwrap();
            state.statements.push((sql.to_string(), params.to_vec()));
            state.queries.push((sql.to_string(), params.to_vec()));
            state.results.pop_front().unwrap_or_default()
        };
        async move { Outcome::Ok(rows) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.record_write(sql, params);
        async move {
            match result {
                Ok(()) => Outcome::Ok(1),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = self.record_write(sql, params).map(|()| {
            let mut state = self.state.lock().unwrap();
            let id = state.next_insert_id;
            state.next_insert_id += 1;
            id
        });
        async move {
            match result {
                Ok(id) => Outcome::Ok(id),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.record_marker("BEGIN");
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.record_marker("COMMIT");
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.record_marker("ROLLBACK");
        async { Outcome::Ok(()) }
    }
}
