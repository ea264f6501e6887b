//! Query error types

use thiserror::Error;

/// Errors reported to a `find` caller in place of a result set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The query worker is not running (monitor shut down)
    #[error("Query engine unavailable: {0}")]
    Unavailable(String),

    /// The query panicked while building the result set
    #[error("Query failed: {0}")]
    Failed(String),
}

/// Type alias for query results
pub type QueryResult<T> = std::result::Result<T, QueryError>;
