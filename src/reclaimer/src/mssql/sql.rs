//! Statement text sent to SQL Server.
//!
//! Values travel as `@P` parameters. Identifiers cannot, so they are spliced in
//! already quoted by [`crate::identifier`].

use crate::identifier::{DatabaseName, StagingTable, TableName};

/// User tables whose heap or clustered-index partitions hold more than `@P1` rows.
pub const OVERSIZED_TABLES: &str = "\
SELECT s.name AS schema_name, t.name AS table_name, SUM(p.rows) AS row_count
FROM sys.tables t
JOIN sys.schemas s ON s.schema_id = t.schema_id
JOIN sys.partitions p ON p.object_id = t.object_id
WHERE p.index_id IN (0, 1) AND t.is_ms_shipped = 0
GROUP BY s.name, t.name
HAVING SUM(p.rows) > @P1";

pub const DATABASE_STATE: &str = "SELECT state_desc FROM sys.databases WHERE name = @P1";

pub const IMPLICIT_TRANSACTIONS_OFF: &str = "SET IMPLICIT_TRANSACTIONS OFF;";

pub const ROLLBACK_OPEN_TRANSACTION: &str = "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;";

/// `ORDER BY (SELECT NULL)` keeps TOP from sorting.
pub fn capture(table: &TableName, staging: &StagingTable) -> String {
    format!(
        "SELECT TOP (@P1) * INTO {} FROM {} ORDER BY (SELECT NULL);",
        staging.quoted(),
        table.quoted()
    )
}

pub fn truncate(table: &TableName) -> String {
    format!("TRUNCATE TABLE {};", table.quoted())
}

pub fn restore(table: &TableName, staging: &StagingTable) -> String {
    format!(
        "INSERT INTO {} SELECT * FROM {};",
        table.quoted(),
        staging.quoted()
    )
}

pub fn drop_staging(staging: &StagingTable) -> String {
    format!("DROP TABLE IF EXISTS {};", staging.quoted())
}

pub fn shrink_database(database: &DatabaseName) -> String {
    format!("DBCC SHRINKDATABASE ({});", database.quoted())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_statements() {
        let table = TableName::new("dbo", "Order Lines").unwrap();
        let staging = StagingTable::generate();
        let s = staging.as_str();

        assert_eq!(
            capture(&table, &staging),
            format!("SELECT TOP (@P1) * INTO [{s}] FROM [dbo].[Order Lines] ORDER BY (SELECT NULL);")
        );
        assert_eq!(truncate(&table), "TRUNCATE TABLE [dbo].[Order Lines];");
        assert_eq!(
            restore(&table, &staging),
            format!("INSERT INTO [dbo].[Order Lines] SELECT * FROM [{s}];")
        );
        assert_eq!(drop_staging(&staging), format!("DROP TABLE IF EXISTS [{s}];"));
    }

    #[test]
    fn test_shrink_quotes_database() {
        let db = DatabaseName::new("Sales]; SHUTDOWN; --").unwrap();
        assert_eq!(
            shrink_database(&db),
            "DBCC SHRINKDATABASE ([Sales]]; SHUTDOWN; --]);"
        );
    }

    #[test]
    fn test_queries_bind_values() {
        assert!(OVERSIZED_TABLES.contains("HAVING SUM(p.rows) > @P1"));
        assert!(OVERSIZED_TABLES.contains("p.index_id IN (0, 1)"));
        assert!(DATABASE_STATE.ends_with("name = @P1"));
    }
}
