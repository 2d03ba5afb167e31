//! Error types for TMQRIG operations

use std::time::Duration;
use thiserror::Error;

/// Query executor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Transport error against {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Request to {endpoint} failed with status {status}: {message}")]
    HttpStatus {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Server rejected statement with code {code:#x}: {desc}")]
    Server { code: i64, desc: String },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Database not found: {database}")]
    DatabaseNotFound { database: String },

    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Unsupported statement: {statement}")]
    Unsupported { statement: String },

    #[error("Injected failure: {reason}")]
    Injected { reason: String },

    #[error("Executor lock poisoned")]
    LockPoisoned,
}

impl ExecutorError {
    /// Whether the error only means a table the simulator creates lazily
    /// does not exist yet.
    pub fn is_missing_table(&self) -> bool {
        match self {
            ExecutorError::TableNotFound { .. } | ExecutorError::DatabaseNotFound { .. } => true,
            // 0x2662: table does not exist, 0x0388: database not exist
            ExecutorError::Server { code, .. } => *code == 0x2662 || *code == 0x0388,
            _ => false,
        }
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Value for {field} too long: {got} bytes, max {max}")]
    TooLong { field: String, max: usize, got: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all TMQRIG errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarnessError {
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provisioning failed on `{statement}`: {source}")]
    Provisioning {
        statement: String,
        source: ExecutorError,
    },

    #[error("Insertion into {table} failed: {source}")]
    Insertion { table: String, source: ExecutorError },

    #[error("Failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("Wait for {what} exceeded {waited:?}")]
    WaitExceeded { what: String, waited: Duration },

    #[error("Wait for {what} cancelled")]
    Cancelled { what: String },

    #[error("Worker {worker} failed: {reason}")]
    WorkerFailed { worker: String, reason: String },

    #[error("Failed to decode {table} row {row}: {source}")]
    ResultDecode {
        table: String,
        row: usize,
        source: ValidationError,
    },

    #[error("Expectation failed for {what}: expected {expected}, got {actual}")]
    ExpectationFailed {
        what: String,
        expected: i64,
        actual: i64,
    },
}

impl HarnessError {
    pub fn wait_exceeded(what: impl Into<String>, waited: Duration) -> Self {
        HarnessError::WaitExceeded {
            what: what.into(),
            waited,
        }
    }

    pub fn is_wait_exceeded(&self) -> bool {
        matches!(self, HarnessError::WaitExceeded { .. })
    }
}

/// Result type alias for TMQRIG operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

// =============================================================================
// TESTS
// =============================================================================
