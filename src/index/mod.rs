//! Secondary indexes and constraints
//!
//! Provides the custom B+-tree, label/property/composite index definitions
//! maintained synchronously by the graph store, and per-label constraints.

pub mod btree;
pub mod constraint;
pub mod manager;

pub use btree::{BPlusTree, DEFAULT_ORDER, MIN_ORDER};
pub use constraint::{Constraint, ConstraintError, ConstraintKind, ConstraintManager, ConstraintResult};
pub use manager::{IndexDefinition, IndexKey, IndexKind, IndexManager, IndexScope, IndexStats};

use thiserror::Error;

/// Index errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Index already exists: {0}")]
    AlreadyExists(String),

    #[error("Index not found: {0}")]
    NotFound(String),

    #[error("Invalid index definition: {0}")]
    InvalidDefinition(String),

    /// Structural check failed (see `BPlusTree::verify`)
    #[error("Index invariant violated: {0}")]
    Invariant(String),
}

pub type IndexResult<T> = Result<T, IndexError>;
