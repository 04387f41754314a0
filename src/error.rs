//! Error kinds shared by every layer of the storage engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(String),

    #[error("permission denied: user '{user}' cannot {operation} on table '{table}'")]
    PermissionDenied {
        user: String,
        operation: String,
        table: String,
    },

    #[error("cannot find transaction.")]
    NoTransaction,

    #[error("transaction is already exists.")]
    TransactionExists,

    #[error("row conflict: transaction was aborted by a forced termination")]
    RowConflictAborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arithmetic overflow")]
    Overflow,

    #[error("no free session slot")]
    NoFreeSlot,

    #[error("concurrent getConnection() is not allowed")]
    ConcurrencyViolation,

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),
}

pub type Result<T> = std::result::Result<T, Error>;
