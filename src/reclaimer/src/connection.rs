//! The connection capability the core runs on.
//!
//! A [`ConnectionProvider`] opens one [`Session`] per database. The session
//! exposes exactly the engine operations a reclamation cycle needs, and the
//! implementation owns the statement text. Each call is its own committed
//! unit; no transaction spans two calls.

use std::fmt;

use async_trait::async_trait;
use common::config::{DatabaseConfig, Secret};

use crate::error::EngineError;
use crate::identifier::{DatabaseName, StagingTable, TableName};
use crate::selector::CandidateTable;

/// Where and as whom to connect. Shared by every database of a run.
#[derive(Clone)]
pub struct ServerInfo {
    pub driver: String,
    pub server: String,
    pub uid: String,
    pub pwd: Secret,
    pub trust_server_certificate: bool,
}

impl fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInfo")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("uid", &self.uid)
            .field("pwd", &self.pwd)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .finish()
    }
}

impl From<&DatabaseConfig> for ServerInfo {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            driver: config.driver.clone(),
            server: config.server.clone(),
            uid: config.uid.clone(),
            pwd: config.pwd.clone(),
            trust_server_certificate: config.trust_server_certificate,
        }
    }
}

/// An open connection to one database.
#[async_trait]
pub trait Session: Send {
    /// User tables whose summed heap/clustered-index row count exceeds `threshold`.
    async fn tables_exceeding(&mut self, threshold: u64)
    -> Result<Vec<CandidateTable>, EngineError>;

    /// Copy at most `limit` rows of `table`, in no particular order, into a new
    /// `staging` table. Returns the number of rows captured.
    async fn capture_rows(
        &mut self,
        table: &TableName,
        staging: &StagingTable,
        limit: u64,
    ) -> Result<u64, EngineError>;

    /// Deallocate every row of `table`.
    async fn truncate_table(&mut self, table: &TableName) -> Result<(), EngineError>;

    /// Copy every row of `staging` back into `table`. Returns the number of rows inserted.
    async fn restore_rows(
        &mut self,
        table: &TableName,
        staging: &StagingTable,
    ) -> Result<u64, EngineError>;

    /// Drop `staging` if it exists.
    async fn drop_staging(&mut self, staging: &StagingTable) -> Result<(), EngineError>;

    /// Roll back any transaction left open on the session.
    async fn rollback(&mut self) -> Result<(), EngineError>;

    /// Engine-reported state text of `database`, `None` if it is not visible.
    async fn database_state(
        &mut self,
        database: &DatabaseName,
    ) -> Result<Option<String>, EngineError>;

    /// Make sure no implicit transaction wraps the next statement.
    async fn disable_implicit_transactions(&mut self) -> Result<(), EngineError>;

    /// Release unused space in the files of `database`.
    async fn shrink_database(&mut self, database: &DatabaseName) -> Result<(), EngineError>;

    /// Close the connection.
    async fn close(self: Box<Self>) -> Result<(), EngineError>;
}

/// Opens sessions. Implementations must be shareable across tasks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn open(
        &self,
        server: &ServerInfo,
        database: &DatabaseName,
    ) -> Result<Box<dyn Session>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_from_config_hides_password() {
        let config = DatabaseConfig {
            driver: "ODBC Driver 17 for SQL Server".to_string(),
            server: "sql01".to_string(),
            uid: "sa".to_string(),
            pwd: Secret::new("hunter2"),
            databases: vec!["A".to_string()],
            trust_server_certificate: false,
        };

        let info = ServerInfo::from(&config);

        assert_eq!(info.server, "sql01");
        assert_eq!(info.pwd.expose(), "hunter2");
        assert!(!info.trust_server_certificate);
        let debug = format!("{info:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("trust_server_certificate: false"));
    }
}
