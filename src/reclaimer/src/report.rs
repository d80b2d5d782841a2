//! Results of a reclamation run, per table, per database and overall.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{ReclaimError, RewriteStep};
use crate::identifier::TableName;
use crate::rewriter::RewriteOutcome;
use crate::selector::CandidateTable;
use crate::shrink::ShrinkOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    /// Selected during a dry run, left untouched
    Planned,
    Rewritten {
        rows_captured: u64,
        rows_restored: u64,
    },
    Failed {
        step: Option<RewriteStep>,
        error: String,
    },
    /// Not attempted because the run was cancelled
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: TableName,
    /// Row count observed at selection time
    pub row_count: u64,
    pub status: TableStatus,
}

impl TableReport {
    pub fn planned(candidate: &CandidateTable) -> Self {
        Self::with_status(candidate, TableStatus::Planned)
    }

    pub fn skipped(candidate: &CandidateTable) -> Self {
        Self::with_status(candidate, TableStatus::Skipped)
    }

    pub fn rewritten(candidate: &CandidateTable, outcome: &RewriteOutcome) -> Self {
        Self::with_status(
            candidate,
            TableStatus::Rewritten {
                rows_captured: outcome.rows_captured,
                rows_restored: outcome.rows_restored,
            },
        )
    }

    pub fn failed(candidate: &CandidateTable, error: &ReclaimError) -> Self {
        let step = match error {
            ReclaimError::Rewrite { step, .. } => Some(*step),
            _ => None,
        };
        Self::with_status(
            candidate,
            TableStatus::Failed {
                step,
                error: error.to_string(),
            },
        )
    }

    fn with_status(candidate: &CandidateTable, status: TableStatus) -> Self {
        Self {
            table: candidate.table.clone(),
            row_count: candidate.row_count,
            status,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TableStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShrinkStatus {
    NotAttempted,
    Succeeded { polls: u32 },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseStatus {
    /// Every step of the cycle succeeded
    Succeeded,
    /// The cycle finished but at least one table rewrite failed
    Partial,
    /// The cycle ended early: connection, metadata, readiness or shrink failure
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DatabaseReport {
    pub database: String,
    pub tables: Vec<TableReport>,
    pub shrink: ShrinkStatus,
    /// Error that ended the cycle, if any
    pub fatal: Option<String>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl DatabaseReport {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            tables: Vec::new(),
            shrink: ShrinkStatus::NotAttempted,
            fatal: None,
            cancelled: false,
            duration: Duration::ZERO,
        }
    }

    /// Record the error that ended the cycle.
    pub fn record_fatal(&mut self, error: &ReclaimError) {
        if error.is_cancelled() {
            self.cancelled = true;
        } else {
            self.fatal = Some(error.to_string());
        }
    }

    pub fn record_shrink(&mut self, result: &Result<ShrinkOutcome, ReclaimError>) {
        self.shrink = match result {
            Ok(outcome) => ShrinkStatus::Succeeded {
                polls: outcome.polls,
            },
            Err(e) => ShrinkStatus::Failed {
                error: e.to_string(),
            },
        };
    }

    pub fn status(&self) -> DatabaseStatus {
        if self.cancelled {
            DatabaseStatus::Cancelled
        } else if self.fatal.is_some() || matches!(self.shrink, ShrinkStatus::Failed { .. }) {
            DatabaseStatus::Failed
        } else if self.tables.iter().any(TableReport::is_failed) {
            DatabaseStatus::Partial
        } else {
            DatabaseStatus::Succeeded
        }
    }

    pub fn tables_rewritten(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Rewritten { .. }))
            .count()
    }

    pub fn tables_failed(&self) -> usize {
        self.tables.iter().filter(|t| t.is_failed()).count()
    }
}

/// Result of one run over every configured database
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub databases: Vec<DatabaseReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.databases
            .iter()
            .all(|db| db.status() == DatabaseStatus::Succeeded)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseReport> {
        self.databases.iter().find(|db| db.database == name)
    }

    /// Log one line per database and a run summary
    pub fn log(&self) {
        for db in &self.databases {
            let status = db.status();
            if status == DatabaseStatus::Succeeded {
                info!(
                    run_id = %self.run_id,
                    database = %db.database,
                    status = ?status,
                    tables_rewritten = db.tables_rewritten(),
                    shrink = ?db.shrink,
                    duration_ms = db.duration.as_millis() as u64,
                    "Database cycle finished"
                );
            } else {
                warn!(
                    run_id = %self.run_id,
                    database = %db.database,
                    status = ?status,
                    tables_rewritten = db.tables_rewritten(),
                    tables_failed = db.tables_failed(),
                    shrink = ?db.shrink,
                    error = db.fatal.as_deref().unwrap_or(""),
                    "Database cycle finished with problems"
                );
            }
        }

        let succeeded = self
            .databases
            .iter()
            .filter(|db| db.status() == DatabaseStatus::Succeeded)
            .count();
        info!(
            run_id = %self.run_id,
            databases = self.databases.len(),
            succeeded,
            failed = self.databases.len() - succeeded,
            duration_ms = (self.completed_at - self.started_at).num_milliseconds(),
            "Reclamation run completed"
        );
    }
}
