//! Wait for a database to be ONLINE, then shrink it.
//!
//! The orchestrator is a small state machine:
//!
//! ```text
//! Polling --ONLINE--> Settling --settle_delay--> Shrinking --ok--> Done
//!    |  ^                                            |
//!    +--+ other state: sleep poll_interval           +--error--> Failed
//! ```
//!
//! Polling ends early on cancellation or when the optional deadline passes.
//! The shrink itself is never retried.

use std::fmt;
use std::time::Duration;

use common::config::ShrinkConfig;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::Session;
use crate::error::{EngineError, ReclaimError, Result};
use crate::identifier::DatabaseName;

/// Operational state of a database as reported by `sys.databases.state_desc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseState {
    Online,
    Restoring,
    Recovering,
    RecoveryPending,
    Suspect,
    Emergency,
    Offline,
    Copying,
    OfflineSecondary,
    /// The database is not visible to the session.
    NotFound,
    /// State text this version does not know, kept verbatim.
    Other(String),
}

impl DatabaseState {
    pub fn parse(state_desc: Option<&str>) -> Self {
        let Some(desc) = state_desc else {
            return DatabaseState::NotFound;
        };
        match desc.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => DatabaseState::Online,
            "RESTORING" => DatabaseState::Restoring,
            "RECOVERING" => DatabaseState::Recovering,
            "RECOVERY_PENDING" => DatabaseState::RecoveryPending,
            "SUSPECT" => DatabaseState::Suspect,
            "EMERGENCY" => DatabaseState::Emergency,
            "OFFLINE" => DatabaseState::Offline,
            "COPYING" => DatabaseState::Copying,
            "OFFLINE_SECONDARY" => DatabaseState::OfflineSecondary,
            _ => DatabaseState::Other(desc.to_string()),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DatabaseState::Online)
    }
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            DatabaseState::Online => "ONLINE",
            DatabaseState::Restoring => "RESTORING",
            DatabaseState::Recovering => "RECOVERING",
            DatabaseState::RecoveryPending => "RECOVERY_PENDING",
            DatabaseState::Suspect => "SUSPECT",
            DatabaseState::Emergency => "EMERGENCY",
            DatabaseState::Offline => "OFFLINE",
            DatabaseState::Copying => "COPYING",
            DatabaseState::OfflineSecondary => "OFFLINE_SECONDARY",
            DatabaseState::NotFound => "NOT_FOUND",
            DatabaseState::Other(desc) => desc,
        };
        f.write_str(desc)
    }
}

/// Phases of one shrink attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkPhase {
    Polling,
    Settling,
    Shrinking,
    Done,
}

/// Result of a successful shrink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShrinkOutcome {
    /// Number of state reads, the ONLINE one included
    pub polls: u32,
    /// Time from the first poll until the shrink command returned
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ShrinkOrchestrator {
    poll_interval: Duration,
    settle_delay: Duration,
    max_wait: Option<Duration>,
}

impl From<&ShrinkConfig> for ShrinkOrchestrator {
    fn from(config: &ShrinkConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            settle_delay: config.settle_delay,
            max_wait: config.max_wait,
        }
    }
}

impl Default for ShrinkOrchestrator {
    fn default() -> Self {
        Self::from(&ShrinkConfig::default())
    }
}

impl ShrinkOrchestrator {
    pub fn new(poll_interval: Duration, settle_delay: Duration) -> Self {
        Self {
            poll_interval,
            settle_delay,
            max_wait: None,
        }
    }

    /// Give up polling after `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Poll until `database` is ONLINE, wait the settle delay, then shrink it.
    ///
    /// The shrink command is never issued while the database is in any other
    /// state. `cancel` is honoured at every poll and during every pause.
    pub async fn shrink_when_ready(
        &self,
        session: &mut dyn Session,
        database: &DatabaseName,
        cancel: &CancellationToken,
    ) -> Result<ShrinkOutcome> {
        let started = Instant::now();
        let deadline = self.max_wait.map(|max_wait| started + max_wait);
        let mut phase = ShrinkPhase::Polling;
        let mut polls = 0u32;

        info!(
            poll_interval = ?self.poll_interval,
            max_wait = ?self.max_wait,
            "Waiting for database to be ONLINE"
        );

        loop {
            match phase {
                ShrinkPhase::Polling => {
                    if cancel.is_cancelled() {
                        warn!(polls, "Readiness wait cancelled");
                        return Err(ReclaimError::Cancelled);
                    }

                    let state_desc = session.database_state(database).await.map_err(|source| {
                        ReclaimError::StateRead {
                            database: database.to_string(),
                            source,
                        }
                    })?;
                    polls += 1;
                    let state = DatabaseState::parse(state_desc.as_deref());

                    if state.is_online() {
                        info!(polls, "Database is ONLINE");
                        phase = ShrinkPhase::Settling;
                        continue;
                    }

                    if let Some(deadline) = deadline {
                        if Instant::now() + self.poll_interval > deadline {
                            let waited = started.elapsed();
                            error!(
                                state = %state,
                                waited = ?waited,
                                "Database did not become ONLINE before the deadline"
                            );
                            return Err(ReclaimError::DeadlineExceeded {
                                database: database.to_string(),
                                waited,
                                last_state: state.to_string(),
                            });
                        }
                    }

                    info!(
                        state = %state,
                        retry_in = ?self.poll_interval,
                        "Database not ONLINE yet, waiting"
                    );
                    self.pause(self.poll_interval, cancel).await?;
                }
                ShrinkPhase::Settling => {
                    debug!(settle_delay = ?self.settle_delay, "Waiting before shrink");
                    self.pause(self.settle_delay, cancel).await?;
                    phase = ShrinkPhase::Shrinking;
                }
                ShrinkPhase::Shrinking => {
                    self.shrink(session, database).await?;
                    phase = ShrinkPhase::Done;
                }
                ShrinkPhase::Done => {
                    let elapsed = started.elapsed();
                    info!(polls, elapsed = ?elapsed, "Shrink completed");
                    return Ok(ShrinkOutcome { polls, elapsed });
                }
            }
        }
    }

    async fn shrink(&self, session: &mut dyn Session, database: &DatabaseName) -> Result<()> {
        let to_error = |source: EngineError| {
            error!(error = %source, "Failed to shrink database");
            ReclaimError::Shrink {
                database: database.to_string(),
                source,
            }
        };

        // DBCC SHRINKDATABASE refuses to run inside a user transaction
        session
            .disable_implicit_transactions()
            .await
            .map_err(to_error)?;

        info!("Issuing shrink command");
        session.shrink_database(database).await.map_err(to_error)?;
        info!("Shrink command executed");
        Ok(())
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Shrink wait cancelled");
                Err(ReclaimError::Cancelled)
            }
            _ = sleep(duration) => Ok(()),
        }
    }
}
