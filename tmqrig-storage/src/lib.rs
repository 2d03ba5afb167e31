//! TMQRIG Storage - Query Executor Trait and Implementations
//!
//! Defines the thin executor abstraction the harness talks to. Each executor
//! value is one logical connection: session state such as the current
//! database (`use <db>`) is never shared between executors, so concurrent
//! workers must each obtain their own from an [`ExecutorFactory`].

pub mod mock;
pub mod rest;

pub use mock::{MockExecutor, MockExecutorFactory};
pub use rest::{RestExecutor, RestExecutorFactory};

use async_trait::async_trait;
use tmqrig_core::{ExecutorError, Value};

// ============================================================================
// QUERY RESULT
// ============================================================================

/// Rows and column names returned by one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Result of a statement that returns nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell at `(row, col)`, `None` when out of range.
    pub fn get(&self, row: usize, col: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(col))
    }

    pub fn row(&self, row: usize) -> Option<&[Value]> {
        self.rows.get(row).map(Vec::as_slice)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// EXECUTOR TRAITS
// ============================================================================

/// One connection to the time-series store.
///
/// Implementations are not required to be safe for concurrent use from
/// several workers with different session state; hand each worker its own.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute one statement and return its rows, if any.
    async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutorError>;

    /// Short label used in log fields.
    fn name(&self) -> &str;
}

/// Opens independent executors, one per worker.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SqlExecutor>, ExecutorError>;
}
