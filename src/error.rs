//! Crate-level error type
//!
//! Every component keeps its own error enum; [`Error`] wraps them so callers
//! of [`crate::GraphDatabase`] handle one type.

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::index::{ConstraintError, IndexError};
use crate::query::{CompileError, ExecutionError, LexError, ParseError};
use crate::storage::StorageError;
use crate::transaction::{TransactionError, WalError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Conflicts, timeouts and backend connectivity failures may succeed when
    /// the transaction is retried unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_retryable(),
            Error::Wal(WalError::Storage(e)) => e.is_retryable(),
            Error::Transaction(e) => e.is_retryable(),
            Error::Execution(e) => e.is_retryable(),
            Error::Graph(GraphError::Storage(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
