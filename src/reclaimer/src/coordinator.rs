//! Drives a reclamation run across every configured database.
//!
//! Databases are processed one after another, each in its own cycle:
//! connect, select oversized tables, rewrite them one by one, shrink, close.
//! A cycle owns its connection exclusively and always closes it, whatever
//! happened in between. A failure never leaves its cycle: the next database is
//! attempted regardless.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use common::config::Configuration;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::connection::{ConnectionProvider, ServerInfo, Session};
use crate::error::{ReclaimError, Result};
use crate::identifier::DatabaseName;
use crate::report::{DatabaseReport, RunReport, TableReport};
use crate::rewriter::TableRewriter;
use crate::selector::TableSelector;
use crate::shrink::ShrinkOrchestrator;

/// What a cycle does once connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Select, rewrite, then shrink
    Full,
    /// Skip selection and rewrites, only wait for ONLINE and shrink
    ShrinkOnly,
    /// Select and report candidates; change nothing
    Plan,
}

pub struct CleanupCoordinator {
    provider: Arc<dyn ConnectionProvider>,
    server: ServerInfo,
    selector: TableSelector,
    rewriter: TableRewriter,
    shrinker: ShrinkOrchestrator,
    cancel: CancellationToken,
}

impl CleanupCoordinator {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        server: ServerInfo,
        selector: TableSelector,
        rewriter: TableRewriter,
        shrinker: ShrinkOrchestrator,
    ) -> Self {
        Self {
            provider,
            server,
            selector,
            rewriter,
            shrinker,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a coordinator whose components follow `config`.
    pub fn from_config(provider: Arc<dyn ConnectionProvider>, config: &Configuration) -> Self {
        Self::new(
            provider,
            ServerInfo::from(&config.database),
            TableSelector::new(config.row_threshold),
            TableRewriter::from(&config.rewrite),
            ShrinkOrchestrator::from(&config.shrink),
        )
    }

    /// Stop the run cleanly when `cancel` fires: before the next database,
    /// before the next table rewrite, or during the readiness wait.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Process every database in order and report how each cycle ended.
    pub async fn run(&self, databases: &[DatabaseName], mode: RunMode) -> RunReport {
        let started_at = Utc::now();
        let run_id = format!("reclaim_{}", started_at.timestamp_millis());

        info!(
            run_id = %run_id,
            server = %self.server.server,
            driver = %self.server.driver,
            databases = databases.len(),
            mode = ?mode,
            row_threshold = self.selector.threshold(),
            capture_limit = self.rewriter.capture_limit(),
            "Starting reclamation run"
        );

        let mut reports = Vec::with_capacity(databases.len());
        for database in databases {
            let span = info_span!(
                "database",
                server = %self.server.server,
                database = %database
            );
            let report = self.process_database(database, mode).instrument(span).await;
            reports.push(report);
        }

        let report = RunReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            databases: reports,
        };
        report.log();
        report
    }

    async fn process_database(&self, database: &DatabaseName, mode: RunMode) -> DatabaseReport {
        let started = Instant::now();
        let mut report = DatabaseReport::new(database.as_str());

        if self.cancel.is_cancelled() {
            warn!("Run cancelled, database not processed");
            report.record_fatal(&ReclaimError::Cancelled);
            return report;
        }

        info!("Processing database");

        let mut session = match self.provider.open(&self.server, database).await {
            Ok(session) => session,
            Err(source) => {
                let err = ReclaimError::Connection {
                    database: database.to_string(),
                    source,
                };
                error!(error = %err, "Failed to connect");
                report.record_fatal(&err);
                report.duration = started.elapsed();
                return report;
            }
        };
        info!("Connected");

        let cycle = AssertUnwindSafe(self.run_cycle(session.as_mut(), database, mode, &mut report))
            .catch_unwind()
            .await;

        match cycle {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if !err.is_cancelled() {
                    error!(error = %err, "Database cycle aborted");
                }
                report.record_fatal(&err);
            }
            Err(_) => {
                error!("Database cycle panicked");
                report.fatal = Some("database cycle panicked".to_string());
            }
        }

        match session.close().await {
            Ok(()) => info!("Database connection closed"),
            Err(source) => {
                let err = ReclaimError::Connection {
                    database: database.to_string(),
                    source,
                };
                warn!(error = %err, "Failed to close connection");
                if report.fatal.is_none() {
                    report.record_fatal(&err);
                }
            }
        }

        report.duration = started.elapsed();
        report
    }

    async fn run_cycle(
        &self,
        session: &mut dyn Session,
        database: &DatabaseName,
        mode: RunMode,
        report: &mut DatabaseReport,
    ) -> Result<()> {
        if mode != RunMode::ShrinkOnly {
            let candidates = self
                .selector
                .find_oversized_tables(session, database)
                .await?;

            for (idx, candidate) in candidates.iter().enumerate() {
                if mode == RunMode::Plan {
                    info!(
                        table = %candidate.table,
                        row_count = candidate.row_count,
                        "Would rewrite table"
                    );
                    report.tables.push(TableReport::planned(candidate));
                    continue;
                }

                if self.cancel.is_cancelled() {
                    warn!(
                        remaining = candidates.len() - idx,
                        "Run cancelled, skipping remaining tables"
                    );
                    report
                        .tables
                        .extend(candidates[idx..].iter().map(TableReport::skipped));
                    return Err(ReclaimError::Cancelled);
                }

                info!(
                    table = %candidate.table,
                    row_count = candidate.row_count,
                    "Processing table"
                );
                match self.rewriter.rewrite(session, &candidate.table).await {
                    Ok(outcome) => report
                        .tables
                        .push(TableReport::rewritten(candidate, &outcome)),
                    Err(err) => report.tables.push(TableReport::failed(candidate, &err)),
                }
            }
        }

        if mode == RunMode::Plan {
            return Ok(());
        }

        let result = self
            .shrinker
            .shrink_when_ready(session, database, &self.cancel)
            .await;
        if matches!(&result, Err(err) if err.is_cancelled()) {
            return Err(ReclaimError::Cancelled);
        }
        report.record_shrink(&result);
        Ok(())
    }
}
