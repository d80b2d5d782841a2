//! SQL Server sessions over TDS.
//!
//! Every statement runs in auto-commit mode: implicit transactions are switched
//! off when the session opens, so each call commits on its own. Session-level
//! `SET` options and `DBCC` go out as plain batches; anything carrying a value
//! goes through `sp_executesql` with bound parameters.

pub mod sql;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use crate::connection::{ConnectionProvider, ServerInfo, Session};
use crate::error::EngineError;
use crate::identifier::{DatabaseName, StagingTable, TableName};
use crate::selector::CandidateTable;

const DEFAULT_PORT: u16 = 1433;
const APPLICATION_NAME: &str = "reclaimdb";

type TdsClient = Client<Compat<TcpStream>>;

impl From<tiberius::error::Error> for EngineError {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Server(token) => {
                EngineError::with_code(token.code(), token.message())
            }
            _ => EngineError::new(err.to_string()),
        }
    }
}

/// Split `host`, `host,port`, `host:port` or `tcp:host,port` into host and port.
pub fn parse_server(server: &str) -> Result<(String, u16), EngineError> {
    let address = server.trim();
    let address = address.strip_prefix("tcp:").unwrap_or(address);

    if address.contains('\\') {
        return Err(EngineError::new(format!(
            "Named instance in '{server}' is not supported, use host,port"
        )));
    }

    let (host, port) = match address.rsplit_once(',').or_else(|| address.rsplit_once(':')) {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| EngineError::new(format!("Invalid port in server '{server}'")))?;
            (host.trim(), port)
        }
        None => (address, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(EngineError::new(format!("Missing host in server '{server}'")));
    }
    Ok((host.to_string(), port))
}

fn client_config(server: &ServerInfo, database: &DatabaseName) -> Result<Config, EngineError> {
    let (host, port) = parse_server(&server.server)?;
    let mut config = Config::new();
    config.host(host);
    config.port(port);
    config.database(database.as_str());
    config.application_name(APPLICATION_NAME);
    config.authentication(AuthMethod::sql_server(&server.uid, server.pwd.expose()));
    if server.trust_server_certificate {
        config.trust_cert();
    }
    Ok(config)
}

async fn connect(config: Config) -> Result<TdsClient, EngineError> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // Azure SQL and availability groups may redirect the login
        Err(tiberius::error::Error::Routing { host, port }) => {
            debug!(host = %host, port, "Following server redirect");
            let mut config = config;
            config.host(&host);
            config.port(port);
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Ok(Client::connect(config, tcp.compat_write()).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Opens [`MssqlSession`]s with SQL Server authentication.
#[derive(Debug, Clone, Default)]
pub struct MssqlProvider;

impl MssqlProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionProvider for MssqlProvider {
    async fn open(
        &self,
        server: &ServerInfo,
        database: &DatabaseName,
    ) -> Result<Box<dyn Session>, EngineError> {
        let config = client_config(server, database)?;
        debug!(
            driver = %server.driver,
            address = %config.get_addr(),
            "Opening connection"
        );

        let mut client = connect(config).await?;
        client
            .simple_query(sql::IMPLICIT_TRANSACTIONS_OFF)
            .await?
            .into_results()
            .await?;

        Ok(Box::new(MssqlSession { client }))
    }
}

pub struct MssqlSession {
    client: TdsClient,
}

impl MssqlSession {
    async fn batch(&mut self, statement: &str) -> Result<(), EngineError> {
        self.client.simple_query(statement).await?.into_results().await?;
        Ok(())
    }
}

#[async_trait]
impl Session for MssqlSession {
    async fn tables_exceeding(
        &mut self,
        threshold: u64,
    ) -> Result<Vec<CandidateTable>, EngineError> {
        let threshold = i64::try_from(threshold)
            .map_err(|_| EngineError::new(format!("Row threshold {threshold} out of range")))?;

        let rows = self
            .client
            .query(sql::OVERSIZED_TABLES, &[&threshold])
            .await?
            .into_first_result()
            .await?;

        rows.iter()
            .map(|row| -> Result<CandidateTable, EngineError> {
                let schema: Option<&str> = row.try_get(0)?;
                let name: Option<&str> = row.try_get(1)?;
                let row_count: Option<i64> = row.try_get(2)?;
                let table = TableName::new(schema.unwrap_or_default(), name.unwrap_or_default())
                    .map_err(|e| EngineError::new(e.to_string()))?;
                Ok(CandidateTable {
                    table,
                    row_count: row_count.unwrap_or_default().max(0) as u64,
                })
            })
            .collect()
    }

    async fn capture_rows(
        &mut self,
        table: &TableName,
        staging: &StagingTable,
        limit: u64,
    ) -> Result<u64, EngineError> {
        let limit = i64::try_from(limit)
            .map_err(|_| EngineError::new(format!("Capture limit {limit} out of range")))?;
        let result = self
            .client
            .execute(sql::capture(table, staging), &[&limit])
            .await?;
        Ok(result.total())
    }

    async fn truncate_table(&mut self, table: &TableName) -> Result<(), EngineError> {
        self.batch(&sql::truncate(table)).await
    }

    async fn restore_rows(
        &mut self,
        table: &TableName,
        staging: &StagingTable,
    ) -> Result<u64, EngineError> {
        let result = self
            .client
            .execute(sql::restore(table, staging), &[])
            .await?;
        Ok(result.total())
    }

    async fn drop_staging(&mut self, staging: &StagingTable) -> Result<(), EngineError> {
        self.batch(&sql::drop_staging(staging)).await
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        self.batch(sql::ROLLBACK_OPEN_TRANSACTION).await
    }

    async fn database_state(
        &mut self,
        database: &DatabaseName,
    ) -> Result<Option<String>, EngineError> {
        let row = self
            .client
            .query(sql::DATABASE_STATE, &[&database.as_str()])
            .await?
            .into_row()
            .await?;

        match row {
            Some(row) => {
                let state: Option<&str> = row.try_get(0)?;
                Ok(state.map(str::to_string))
            }
            None => Ok(None),
        }
    }

    async fn disable_implicit_transactions(&mut self) -> Result<(), EngineError> {
        self.batch(sql::IMPLICIT_TRANSACTIONS_OFF).await
    }

    async fn shrink_database(&mut self, database: &DatabaseName) -> Result<(), EngineError> {
        self.batch(&sql::shrink_database(database)).await
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.client.close().await?;
        Ok(())
    }
}
