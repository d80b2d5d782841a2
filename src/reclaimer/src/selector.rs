//! Finds the tables worth rewriting.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::connection::Session;
use crate::error::{ReclaimError, Result};
use crate::identifier::{DatabaseName, TableName};

/// A table whose row count exceeded the threshold when the catalog was read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTable {
    pub table: TableName,
    /// Sum of heap/clustered-index partition row counts
    pub row_count: u64,
}

/// Selects tables whose summed row count exceeds a threshold
#[derive(Debug, Clone)]
pub struct TableSelector {
    threshold: u64,
}

impl TableSelector {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Read the catalog of `database` and return every table with more rows
    /// than the threshold, each once, in the order the engine aggregated them.
    pub async fn find_oversized_tables(
        &self,
        session: &mut dyn Session,
        database: &DatabaseName,
    ) -> Result<Vec<CandidateTable>> {
        let reported = session
            .tables_exceeding(self.threshold)
            .await
            .map_err(|source| ReclaimError::Query {
                database: database.to_string(),
                source,
            })?;

        let mut seen = HashSet::new();
        let candidates: Vec<CandidateTable> = reported
            .into_iter()
            .filter(|candidate| candidate.row_count > self.threshold)
            .filter(|candidate| seen.insert(candidate.table.clone()))
            .collect();

        for candidate in &candidates {
            debug!(
                table = %candidate.table,
                row_count = candidate.row_count,
                "Table exceeds row threshold"
            );
        }

        info!(
            threshold = self.threshold,
            candidates = candidates.len(),
            tables = ?candidates.iter().map(|c| c.table.to_string()).collect::<Vec<_>>(),
            "Table selection completed"
        );

        Ok(candidates)
    }
}
