//! Table rewrite: capture, truncate, restore, cleanup.
//!
//! Truncating and reloading a table hands its pages back to the data file so a
//! later shrink can release them. Only the captured rows survive: a table with
//! more rows than the capture limit comes back with exactly `capture_limit`
//! rows, an arbitrary subset. The limit is the reclamation mechanism, not a
//! side effect.
//!
//! Each step commits on its own. A failure therefore leaves the table either
//! untouched (capture failed), empty (restore failed) or fully restored, and
//! the staging table is dropped whichever step failed.

use std::time::{Duration, Instant};

use common::config::RewriteConfig;
use tracing::{error, info, warn};

use crate::connection::Session;
use crate::error::{EngineError, ReclaimError, Result, RewriteStep};
use crate::identifier::{StagingTable, TableName};

/// Outcome of a completed rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub table: TableName,
    pub rows_captured: u64,
    pub rows_restored: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct TableRewriter {
    capture_limit: u64,
}

impl From<&RewriteConfig> for TableRewriter {
    fn from(config: &RewriteConfig) -> Self {
        Self::new(config.capture_limit)
    }
}

impl TableRewriter {
    pub fn new(capture_limit: u64) -> Self {
        Self { capture_limit }
    }

    pub fn capture_limit(&self) -> u64 {
        self.capture_limit
    }

    /// Rewrite `table` through a fresh staging table.
    ///
    /// On failure of any step the open transaction is rolled back and the
    /// staging table is still dropped. The returned error names the step that
    /// failed first.
    pub async fn rewrite(
        &self,
        session: &mut dyn Session,
        table: &TableName,
    ) -> Result<RewriteOutcome> {
        let started = Instant::now();
        let staging = StagingTable::generate();

        info!(
            table = %table,
            staging = %staging,
            capture_limit = self.capture_limit,
            "Starting table rewrite"
        );

        let steps = self.run_steps(session, table, &staging).await;

        if let Err((step, source)) = &steps {
            error!(
                table = %table,
                step = %step,
                error = %source,
                "Table rewrite failed"
            );
            if let Err(rollback_err) = session.rollback().await {
                warn!(
                    table = %table,
                    error = %rollback_err,
                    "Rollback after failed rewrite step failed"
                );
            }
        }

        let cleanup = session.drop_staging(&staging).await;
        if let Err(e) = &cleanup {
            error!(
                table = %table,
                staging = %staging,
                error = %e,
                "Failed to drop staging table"
            );
        } else {
            info!(table = %table, staging = %staging, "Dropped staging table");
        }

        let (rows_captured, rows_restored) = match (steps, cleanup) {
            (Err((step, source)), _) => {
                return Err(ReclaimError::Rewrite {
                    table: table.clone(),
                    step,
                    source,
                });
            }
            (Ok(_), Err(source)) => {
                return Err(ReclaimError::Rewrite {
                    table: table.clone(),
                    step: RewriteStep::Cleanup,
                    source,
                });
            }
            (Ok(counts), Ok(())) => counts,
        };

        let duration = started.elapsed();
        info!(
            table = %table,
            rows_captured,
            rows_restored,
            duration_ms = duration.as_millis() as u64,
            "Table rewrite completed"
        );

        Ok(RewriteOutcome {
            table: table.clone(),
            rows_captured,
            rows_restored,
            duration,
        })
    }

    async fn run_steps(
        &self,
        session: &mut dyn Session,
        table: &TableName,
        staging: &StagingTable,
    ) -> std::result::Result<(u64, u64), (RewriteStep, EngineError)> {
        let captured = session
            .capture_rows(table, staging, self.capture_limit)
            .await
            .map_err(|e| (RewriteStep::Capture, e))?;
        info!(
            table = %table,
            staging = %staging,
            rows = captured,
            "Captured rows into staging table"
        );

        session
            .truncate_table(table)
            .await
            .map_err(|e| (RewriteStep::Truncate, e))?;
        info!(table = %table, "Truncated table");

        let restored = session
            .restore_rows(table, staging)
            .await
            .map_err(|e| (RewriteStep::Restore, e))?;
        info!(table = %table, rows = restored, "Restored rows from staging table");

        Ok((captured, restored))
    }
}
