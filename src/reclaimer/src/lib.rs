//! Online storage reclamation for SQL Server.
//!
//! A run walks the configured databases one at a time. For each it selects
//! tables whose row count exceeds a threshold, rewrites them through a staging
//! table so their pages are released, waits until the database reports ONLINE
//! and shrinks it.
//!
//! - `selector`: oversized table discovery
//! - `rewriter`: capture, truncate, restore, cleanup of one table
//! - `shrink`: readiness polling and the shrink command
//! - `coordinator`: the per-database cycle and the run report
//! - `mssql`: the SQL Server session implementation

pub mod connection;
pub mod coordinator;
pub mod error;
pub mod identifier;
pub mod mssql;
pub mod report;
pub mod rewriter;
pub mod selector;
pub mod shrink;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use connection::{ConnectionProvider, ServerInfo, Session};
pub use coordinator::{CleanupCoordinator, RunMode};
pub use error::{EngineError, ReclaimError, RewriteStep};
pub use identifier::{DatabaseName, StagingTable, TableName};
pub use mssql::MssqlProvider;
pub use report::{DatabaseReport, DatabaseStatus, RunReport, ShrinkStatus, TableReport, TableStatus};
pub use rewriter::{RewriteOutcome, TableRewriter};
pub use selector::{CandidateTable, TableSelector};
pub use shrink::{DatabaseState, ShrinkOrchestrator, ShrinkOutcome};
