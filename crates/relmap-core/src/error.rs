//! Error types for relmap operations.
//!
//! Storage failures (`Connection`, `Query`, `Transaction`) come from the
//! collaborator. `Config`, `Loader`, `Relation` and `Record` are construction
//! errors raised immediately and never retried. `Command` wraps a failure
//! inside a running command graph, and `Cache` reports an exhausted identity
//! map.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction boundary errors
    Transaction(TransactionError),
    /// Configuration and schema definition errors
    Config(ConfigError),
    /// Loader / node tree construction errors
    Loader(LoaderError),
    /// Relation proxy misuse
    Relation(RelationError),
    /// Entity field / role errors
    Record(RecordError),
    /// A command inside a command graph failed
    Command(CommandError),
    /// Identity map limit exceeded
    Cache(CacheError),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish or keep the connection
    Connect,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Begin failed or a transaction is already open
    Begin,
    /// Commit failed
    Commit,
    /// Rollback failed
    Rollback,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct LoaderError {
    pub message: String,
}

#[derive(Debug)]
pub struct RelationError {
    pub relation: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct RecordError {
    pub role: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct CommandError {
    pub kind: CommandErrorKind,
    /// Label of the command that failed, e.g. `insert into posts`.
    pub command: String,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// A command consumed context that no upstream command produced.
    MissingContext,
    /// An UPDATE or DELETE was built without a WHERE predicate.
    MissingPredicate,
    /// The collaborator failed while executing the command.
    Failed,
}

#[derive(Debug)]
pub struct CacheError {
    pub limit: usize,
    pub message: String,
}

impl Error {
    /// Follow command wrappers down to the collaborator error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Command(CommandError {
                source: Some(source),
                ..
            }) => source.root_cause(),
            other => other,
        }
    }

    /// Classify a storage failure by its SQLSTATE code.
    ///
    /// Connection implementations call this so retry decisions do not
    /// depend on the driver.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match code.get(..2) {
            Some("08") => {
                return Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message,
                    source: None,
                });
            }
            Some("23") => QueryErrorKind::Constraint,
            Some("42") if matches!(code, "42P01" | "42703" | "42S02" | "42S22") => {
                QueryErrorKind::NotFound
            }
            Some("42") => QueryErrorKind::Syntax,
            Some("40") => {
                if code == "40001" {
                    QueryErrorKind::Serialization
                } else {
                    QueryErrorKind::Deadlock
                }
            }
            Some("57") if code == "57014" => QueryErrorKind::Timeout,
            _ => QueryErrorKind::Database,
        };
        Error::Query(QueryError {
            kind,
            sql: None,
            sqlstate: Some(code.to_string()),
            message,
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, serialization failure, statement timeout)?
    pub fn is_retryable(&self) -> bool {
        match self.root_cause() {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this a configuration or wiring mistake rather than a storage failure?
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::Config(_)
                | Error::Loader(_)
                | Error::Relation(_)
                | Error::Record(_)
                | Error::Command(CommandError {
                    kind: CommandErrorKind::MissingPredicate,
                    ..
                })
        )
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self.root_cause() {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Label of the failing command, for errors raised inside a command graph.
    pub fn command(&self) -> Option<&str> {
        match self {
            Error::Command(c) => Some(&c.command),
            _ => None,
        }
    }

    /// Shorthand for a loader construction error.
    pub fn loader(message: impl Into<String>) -> Self {
        Error::Loader(LoaderError {
            message: message.into(),
        })
    }

    /// Shorthand for a configuration error without a source.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a relation error on a named relation.
    pub fn relation(relation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Relation(RelationError {
            relation: Some(relation.into()),
            message: message.into(),
        })
    }

    /// Shorthand for a record error on a role.
    pub fn record(role: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Record(RecordError {
            role: Some(role.into()),
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Loader(e) => write!(f, "Loader error: {}", e.message),
            Error::Relation(e) => write!(f, "Relation error: {}", e),
            Error::Record(e) => write!(f, "Record error: {}", e),
            Error::Command(e) => write!(f, "Command error: {}", e),
            Error::Cache(e) => write!(f, "Cache error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let boxed: &(dyn std::error::Error + Send + Sync + 'static) = match self {
            Error::Connection(ConnectionError {
                source: Some(source),
                ..
            })
            | Error::Query(QueryError {
                source: Some(source),
                ..
            })
            | Error::Config(ConfigError {
                source: Some(source),
                ..
            }) => &**source,
            Error::Command(CommandError {
                source: Some(source),
                ..
            }) => return Some(&**source),
            _ => return None,
        };
        Some(boxed)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for RelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(relation) => write!(f, "{} (relation '{}')", self.message, relation),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Some(role) => write!(f, "{} (role '{}')", self.message, role),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} failed: {}", self.command, source),
            None => write!(f, "{}: {}", self.command, self.message),
        }
    }
}

macro_rules! error_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::$variant(err)
                }
            }
        )*
    };
}

error_from! {
    ConnectionError => Connection,
    QueryError => Query,
    TypeError => Type,
    TransactionError => Transaction,
    ConfigError => Config,
    LoaderError => Loader,
    RelationError => Relation,
    RecordError => Record,
    CommandError => Command,
    CacheError => Cache,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
