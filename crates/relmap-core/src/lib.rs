//! Core types for relmap.
//!
//! This crate provides the storage-facing vocabulary shared by the ORM:
//!
//! - `Value` and `Row` for dynamically typed column data
//! - `Connection` trait and forward-only `Cursor`
//! - abstract query descriptions rendered per `Dialect`
//! - `Error` taxonomy
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod identifiers;
pub mod query;
pub mod row;
pub mod value;

pub use connection::{Connection, Cursor};
pub use error::{
    CacheError, CommandError, CommandErrorKind, ConfigError, ConnectionError,
    ConnectionErrorKind, Error, LoaderError, QueryError, QueryErrorKind, RecordError,
    RelationError, Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use identifiers::{is_valid_identifier, validate_identifier};
pub use query::{
    ColumnRef, Condition, DeleteQuery, Dialect, InsertQuery, Join, JoinType, OrderBy,
    SelectQuery, UpdateQuery,
};
pub use row::{FromValue, Row};
pub use value::Value;

/// Unwrap an `Outcome` inside a function returning `Outcome`, forwarding
/// `Err`, `Cancelled` and `Panicked` to the caller.
///
/// `try_outcome!(result: expr)` does the same for a plain `Result`.
#[macro_export]
macro_rules! try_outcome {
    (result: $e:expr) => {
        match $e {
            ::std::result::Result::Ok(value) => value,
            ::std::result::Result::Err(err) => return $crate::Outcome::Err(err),
        }
    };
    ($e:expr) => {
        match $e {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}
