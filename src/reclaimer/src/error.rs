//! Error taxonomy for a reclamation run.
//!
//! `EngineError` is whatever the server or the transport reported. `ReclaimError`
//! says which part of a database cycle it broke, which decides how far the
//! failure reaches: connection and query failures end the database cycle, a
//! rewrite failure only abandons one table, a shrink failure ends the cycle
//! without success. Nothing crosses a database boundary.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::identifier::TableName;

/// A failure reported by the database engine or the connection carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Engine error number, when the server sent one.
    pub code: Option<u32>,
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "engine error {code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("I/O error: {err}"))
    }
}

/// Step of the table rewrite sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewriteStep {
    Capture,
    Truncate,
    Restore,
    Cleanup,
}

impl fmt::Display for RewriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RewriteStep::Capture => "capture",
            RewriteStep::Truncate => "truncate",
            RewriteStep::Restore => "restore",
            RewriteStep::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ReclaimError {
    /// Opening or closing the connection failed.
    #[error("Connection to database '{database}' failed: {source}")]
    Connection {
        database: String,
        source: EngineError,
    },

    /// Reading table metadata failed.
    #[error("Metadata query on database '{database}' failed: {source}")]
    Query {
        database: String,
        source: EngineError,
    },

    /// One step of a table rewrite failed.
    #[error("Rewrite of table {table} failed at {step}: {source}")]
    Rewrite {
        table: TableName,
        step: RewriteStep,
        source: EngineError,
    },

    /// Reading the readiness state failed.
    #[error("Reading state of database '{database}' failed: {source}")]
    StateRead {
        database: String,
        source: EngineError,
    },

    /// The shrink command failed.
    #[error("Shrink of database '{database}' failed: {source}")]
    Shrink {
        database: String,
        source: EngineError,
    },

    /// The database did not become ONLINE within the configured wait.
    #[error("Database '{database}' not ONLINE after {waited:?} (last state: {last_state})")]
    DeadlineExceeded {
        database: String,
        waited: Duration,
        last_state: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid {kind} identifier '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl ReclaimError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReclaimError::Cancelled)
    }
}

pub type Result<T, E = ReclaimError> = std::result::Result<T, E>;
