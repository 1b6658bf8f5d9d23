//! Error taxonomy for batch ingestion.
//!
//! Only store failures are errors. Rows that cannot take part in a relation
//! are counted and described on the operation's `OperationResult` instead, and
//! catalog insert races are absorbed by insert-or-ignore.

use std::fmt;

use thiserror::Error;

/// A genuine statement or connection failure. Always fatal to the batch.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    #[error("current transaction is aborted, commands ignored until rollback")]
    TransactionAborted,

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("catalog {catalog} incomplete: {missing} key(s) unresolved after insert")]
    IncompleteCatalog { catalog: String, missing: usize },

    #[error("table {0} has no surrogate id column")]
    NoIdColumn(String),

    #[error("connection already closed")]
    Closed,

    #[error("row has {actual} values, table {table} expects {expected}")]
    Arity {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("statement failed on {table}: {message}")]
    Injected { table: String, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Orchestrator phase, used to label failures and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Catalogs,
    Cases,
    Details,
    DependentDetails,
    Commit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Catalogs => "catalogs",
            Self::Cases => "cases",
            Self::Details => "details",
            Self::DependentDetails => "dependent-details",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// The single failure a caller receives for a batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{phase} phase failed: {source}")]
    Store {
        phase: Phase,
        #[source]
        source: StoreError,
    },

    #[error("{phase} phase failed in operation {operation}: {source}")]
    Operation {
        phase: Phase,
        operation: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid ingest plan: {0}")]
    Plan(String),

    #[error("{phase} phase worker task failed: {message}")]
    Worker { phase: Phase, message: String },

    #[error("failed to restore referential integrity enforcement: {0}")]
    Restore(#[source] StoreError),
}

impl IngestError {
    pub fn store(phase: Phase, source: StoreError) -> Self {
        Self::Store { phase, source }
    }

    pub fn operation(phase: Phase, operation: impl Into<String>, source: StoreError) -> Self {
        Self::Operation {
            phase,
            operation: operation.into(),
            source,
        }
    }

    /// Phase in which the batch stopped, when known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Store { phase, .. }
            | Self::Operation { phase, .. }
            | Self::Worker { phase, .. } => Some(*phase),
            Self::Plan(_) | Self::Restore(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
