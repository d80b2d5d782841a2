//! In-memory engine for tests.
//!
//! [`InMemoryServer`] keeps databases, tables (as partitioned row ids), global
//! staging tables and a journal of every call, and hands out sessions that
//! implement [`Session`]. Failures can be injected per database and per step.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::connection::{ConnectionProvider, ServerInfo, Session};
use crate::error::EngineError;
use crate::identifier::{DatabaseName, StagingTable, TableName};
use crate::selector::CandidateTable;
use crate::shrink::DatabaseState;

/// Where to inject a failure
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Capture(TableName),
    Truncate(TableName),
    Restore(TableName),
    DropStaging,
    Rollback,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Opened {
        database: String,
    },
    Closed {
        database: String,
    },
    MetadataRead {
        database: String,
    },
    Captured {
        database: String,
        table: TableName,
        staging: String,
        rows: u64,
    },
    Truncated {
        database: String,
        table: TableName,
    },
    Restored {
        database: String,
        table: TableName,
        rows: u64,
    },
    StagingDropped {
        staging: String,
        existed: bool,
    },
    RolledBack {
        database: String,
    },
    StatePolled {
        database: String,
        state: Option<String>,
        at: Instant,
    },
    ImplicitTransactionsDisabled {
        database: String,
    },
    Shrunk {
        database: String,
        at: Instant,
    },
    ShrinkFailed {
        database: String,
    },
}

#[derive(Debug, Default)]
struct FakeTable {
    partitions: Vec<Vec<u64>>,
}

impl FakeTable {
    fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.len() as u64).sum()
    }

    fn rows(&self) -> Vec<u64> {
        self.partitions.iter().flatten().copied().collect()
    }
}

#[derive(Debug, Default)]
struct FakeDatabase {
    tables: BTreeMap<TableName, FakeTable>,
    states: VecDeque<DatabaseState>,
    failures: HashMap<FailurePoint, String>,
    metadata_error: Option<String>,
    metadata_panic: bool,
    state_error: Option<String>,
    shrink_error: Option<EngineError>,
    unreachable: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    databases: HashMap<String, FakeDatabase>,
    staging: HashMap<String, Vec<u64>>,
    events: Vec<ServerEvent>,
    next_row_id: u64,
}

impl ServerState {
    fn database(&mut self, name: &str) -> Result<&mut FakeDatabase, EngineError> {
        self.databases.get_mut(name).ok_or_else(|| {
            EngineError::with_code(911, format!("Database '{name}' does not exist"))
        })
    }

    fn injected(&mut self, database: &str, point: &FailurePoint) -> Result<(), EngineError> {
        match self.database(database)?.failures.get(point) {
            Some(message) => Err(EngineError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn table(&mut self, database: &str, table: &TableName) -> Result<&mut FakeTable, EngineError> {
        self.database(database)?
            .tables
            .get_mut(table)
            .ok_or_else(|| EngineError::with_code(208, format!("Invalid object name '{table}'")))
    }
}

/// A shared fake SQL Server. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.inner.lock().expect("in-memory server state poisoned")
    }

    pub fn add_database(&self, name: &str) {
        self.state()
            .databases
            .insert(name.to_string(), FakeDatabase::default());
    }

    pub fn add_table(&self, database: &str, schema: &str, table: &str, rows: u64) {
        self.add_partitioned_table(database, schema, table, &[rows]);
    }

    /// Add a table spread over partitions holding the given row counts.
    pub fn add_partitioned_table(&self, database: &str, schema: &str, table: &str, rows: &[u64]) {
        let name = TableName::new(schema, table).expect("valid table name");
        let mut state = self.state();
        let mut partitions = Vec::with_capacity(rows.len());
        for &count in rows {
            let start = state.next_row_id;
            state.next_row_id += count;
            partitions.push((start..start + count).collect());
        }
        state
            .databases
            .get_mut(database)
            .expect("database added before its tables")
            .tables
            .insert(name, FakeTable { partitions });
    }

    /// States returned by successive polls; the last one repeats.
    pub fn script_states(&self, database: &str, states: &[DatabaseState]) {
        if let Some(db) = self.state().databases.get_mut(database) {
            db.states = states.iter().cloned().collect();
        }
    }

    pub fn fail_at(&self, database: &str, point: FailurePoint, message: &str) {
        if let Some(db) = self.state().databases.get_mut(database) {
            db.failures.insert(point, message.to_string());
        }
    }

    pub fn fail_metadata(&self, database: &str, message: &str) {
        if let Some(db) = self.state().databases.get_mut(database) {
            db.metadata_error = Some(message.to_string());
        }
    }

    /// Make the catalog read panic instead of returning an error.
    pub fn panic_on_metadata(&self, database: &str) {
        if let Some(db) = self.state().databases.get_mut(database) {
            db.metadata_panic = true;
        }
    }

    pub fn fail_state_read(&self, database: &str, message: &str) {
        if let Some(db) = self.state().databases.get_mut(database) {
            db.state_error = Some(message.to_string());
        }
    }

    pub fn fail_shrink(&self, database: &str, error: EngineError) {
        if let Some(db) = self.state().databases.get_mut(database) {
            db.shrink_error = Some(error);
        }
    }

    /// Refuse connections to `database` (it may or may not exist).
    pub fn make_unreachable(&self, database: &str) {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .unreachable = true;
    }

    /// A session on `database` that bypasses the provider (no open/close journal).
    pub fn session(&self, database: &str) -> InMemorySession {
        InMemorySession {
            server: self.clone(),
            database: database.to_string(),
            implicit_transactions_disabled: false,
        }
    }

    pub fn provider(&self) -> InMemoryProvider {
        InMemoryProvider {
            server: self.clone(),
        }
    }

    pub fn table_rows(&self, database: &str, table: &TableName) -> Vec<u64> {
        self.state()
            .databases
            .get(database)
            .and_then(|db| db.tables.get(table))
            .map(FakeTable::rows)
            .unwrap_or_default()
    }

    /// Names of global staging tables that currently exist.
    pub fn staging_tables(&self) -> Vec<String> {
        self.state().staging.keys().cloned().collect()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.state().events.clone()
    }

    fn count(&self, predicate: impl Fn(&ServerEvent) -> bool) -> usize {
        self.state().events.iter().filter(|e| predicate(e)).count()
    }

    pub fn opens(&self, database: &str) -> usize {
        self.count(|e| matches!(e, ServerEvent::Opened { database: d } if d == database))
    }

    pub fn closes(&self, database: &str) -> usize {
        self.count(|e| matches!(e, ServerEvent::Closed { database: d } if d == database))
    }

    pub fn rollbacks(&self, database: &str) -> usize {
        self.count(|e| matches!(e, ServerEvent::RolledBack { database: d } if d == database))
    }

    /// Successful shrinks
    pub fn shrink_count(&self, database: &str) -> usize {
        self.count(|e| matches!(e, ServerEvent::Shrunk { database: d, .. } if d == database))
    }

    /// Shrink commands issued, successful or not
    pub fn shrink_attempts(&self, database: &str) -> usize {
        self.count(|e| {
            matches!(e, ServerEvent::Shrunk { database: d, .. } | ServerEvent::ShrinkFailed { database: d } if d == database)
        })
    }
}

/// Opens [`InMemorySession`]s and journals every open.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    server: InMemoryServer,
}

#[async_trait]
impl ConnectionProvider for InMemoryProvider {
    async fn open(
        &self,
        _server: &ServerInfo,
        database: &DatabaseName,
    ) -> Result<Box<dyn Session>, EngineError> {
        {
            let mut state = self.server.state();
            let reachable = state
                .databases
                .get(database.as_str())
                .is_some_and(|db| !db.unreachable);
            if !reachable {
                return Err(EngineError::with_code(
                    4060,
                    format!("Cannot open database \"{database}\" requested by the login"),
                ));
            }
            state.events.push(ServerEvent::Opened {
                database: database.to_string(),
            });
        }
        Ok(Box::new(self.server.session(database.as_str())))
    }
}

#[derive(Debug)]
pub struct InMemorySession {
    server: InMemoryServer,
    database: String,
    implicit_transactions_disabled: bool,
}

#[async_trait]
impl Session for InMemorySession {
    async fn tables_exceeding(
        &mut self,
        threshold: u64,
    ) -> Result<Vec<CandidateTable>, EngineError> {
        let mut state = self.server.state();
        state.events.push(ServerEvent::MetadataRead {
            database: self.database.clone(),
        });
        if state.database(&self.database)?.metadata_panic {
            // Release the lock first so the server stays usable after unwinding
            drop(state);
            panic!("catalog read panicked on '{}'", self.database);
        }
        let db = state.database(&self.database)?;
        if let Some(message) = &db.metadata_error {
            return Err(EngineError::new(message.clone()));
        }
        Ok(db
            .tables
            .iter()
            .filter(|(_, table)| table.row_count() > threshold)
            .map(|(name, table)| CandidateTable {
                table: name.clone(),
                row_count: table.row_count(),
            })
            .collect())
    }

    async fn capture_rows(
        &mut self,
        table: &TableName,
        staging: &StagingTable,
        limit: u64,
    ) -> Result<u64, EngineError> {
        let mut state = self.server.state();
        state.injected(&self.database, &FailurePoint::Capture(table.clone()))?;
        if state.staging.contains_key(staging.as_str()) {
            return Err(EngineError::with_code(
                2714,
                format!("There is already an object named '{staging}' in the database"),
            ));
        }
        let rows: Vec<u64> = state
            .table(&self.database, table)?
            .rows()
            .into_iter()
            .take(limit as usize)
            .collect();
        let captured = rows.len() as u64;
        state.staging.insert(staging.as_str().to_string(), rows);
        state.events.push(ServerEvent::Captured {
            database: self.database.clone(),
            table: table.clone(),
            staging: staging.as_str().to_string(),
            rows: captured,
        });
        Ok(captured)
    }

    async fn truncate_table(&mut self, table: &TableName) -> Result<(), EngineError> {
        let mut state = self.server.state();
        state.injected(&self.database, &FailurePoint::Truncate(table.clone()))?;
        for partition in &mut state.table(&self.database, table)?.partitions {
            partition.clear();
        }
        state.events.push(ServerEvent::Truncated {
            database: self.database.clone(),
            table: table.clone(),
        });
        Ok(())
    }

    async fn restore_rows(
        &mut self,
        table: &TableName,
        staging: &StagingTable,
    ) -> Result<u64, EngineError> {
        let mut state = self.server.state();
        state.injected(&self.database, &FailurePoint::Restore(table.clone()))?;
        let rows = state
            .staging
            .get(staging.as_str())
            .cloned()
            .ok_or_else(|| {
                EngineError::with_code(208, format!("Invalid object name '{staging}'"))
            })?;
        let restored = rows.len() as u64;
        let target = state.table(&self.database, table)?;
        if target.partitions.is_empty() {
            target.partitions.push(Vec::new());
        }
        target.partitions[0].extend(rows);
        state.events.push(ServerEvent::Restored {
            database: self.database.clone(),
            table: table.clone(),
            rows: restored,
        });
        Ok(restored)
    }

    async fn drop_staging(&mut self, staging: &StagingTable) -> Result<(), EngineError> {
        let mut state = self.server.state();
        state.injected(&self.database, &FailurePoint::DropStaging)?;
        let existed = state.staging.remove(staging.as_str()).is_some();
        state.events.push(ServerEvent::StagingDropped {
            staging: staging.as_str().to_string(),
            existed,
        });
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        let mut state = self.server.state();
        state.injected(&self.database, &FailurePoint::Rollback)?;
        state.events.push(ServerEvent::RolledBack {
            database: self.database.clone(),
        });
        Ok(())
    }

    async fn database_state(
        &mut self,
        database: &DatabaseName,
    ) -> Result<Option<String>, EngineError> {
        let mut state = self.server.state();
        let db = state.database(database.as_str())?;
        if let Some(message) = &db.state_error {
            return Err(EngineError::new(message.clone()));
        }
        let current = if db.states.len() > 1 {
            db.states.pop_front()
        } else {
            db.states.front().cloned()
        }
        .unwrap_or(DatabaseState::Online);
        let desc = match current {
            DatabaseState::NotFound => None,
            other => Some(other.to_string()),
        };
        state.events.push(ServerEvent::StatePolled {
            database: database.to_string(),
            state: desc.clone(),
            at: Instant::now(),
        });
        Ok(desc)
    }

    async fn disable_implicit_transactions(&mut self) -> Result<(), EngineError> {
        self.implicit_transactions_disabled = true;
        self.server
            .state()
            .events
            .push(ServerEvent::ImplicitTransactionsDisabled {
                database: self.database.clone(),
            });
        Ok(())
    }

    async fn shrink_database(&mut self, database: &DatabaseName) -> Result<(), EngineError> {
        let mut state = self.server.state();
        let shrink_error = state.database(database.as_str())?.shrink_error.clone();
        let result = if !self.implicit_transactions_disabled {
            Err(EngineError::with_code(
                574,
                "DBCC SHRINKDATABASE statement cannot be used inside a user transaction",
            ))
        } else if let Some(err) = shrink_error {
            Err(err)
        } else {
            Ok(())
        };
        let event = match result {
            Ok(()) => ServerEvent::Shrunk {
                database: database.to_string(),
                at: Instant::now(),
            },
            Err(_) => ServerEvent::ShrinkFailed {
                database: database.to_string(),
            },
        };
        state.events.push(event);
        result
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        let mut state = self.server.state();
        state.events.push(ServerEvent::Closed {
            database: self.database.clone(),
        });
        state.injected(&self.database, &FailurePoint::Close)
    }
}
