//! SQL Server identifiers that are safe to splice into statement text.
//!
//! Statements such as `TRUNCATE TABLE` and `DBCC SHRINKDATABASE` cannot take
//! identifiers as bound parameters. Every identifier here is validated on
//! construction and rendered bracket-quoted with `]` doubled, so no value can
//! end the quoted name early.

use std::fmt;

use uuid::Uuid;

use crate::error::ReclaimError;

/// Longest identifier the engine accepts (`sysname`).
pub const MAX_IDENTIFIER_LEN: usize = 128;

fn validate(kind: &'static str, value: &str) -> Result<(), ReclaimError> {
    let reason = if value.trim().is_empty() {
        Some("must not be blank")
    } else if value.chars().count() > MAX_IDENTIFIER_LEN {
        Some("longer than 128 characters")
    } else if value.chars().any(char::is_control) {
        Some("contains control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ReclaimError::InvalidIdentifier {
            kind,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Quote a single identifier part: `Order Lines` -> `[Order Lines]`, `a]b` -> `[a]]b]`.
pub fn quote(part: &str) -> String {
    format!("[{}]", part.replace(']', "]]"))
}

/// A database name taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn new(name: impl Into<String>) -> Result<Self, ReclaimError> {
        let name = name.into();
        validate("database", &name)?;
        Ok(Self(name))
    }

    /// Raw name, for bound parameters and log fields.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        quote(&self.0)
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A schema-qualified user table, as reported by the engine's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    schema: String,
    name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self, ReclaimError> {
        let schema = schema.into();
        let name = name.into();
        validate("schema", &schema)?;
        validate("table", &name)?;
        Ok(Self { schema, name })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[schema].[name]`
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote(&self.schema), quote(&self.name))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted())
    }
}

/// Name of the global temporary table holding captured rows during one rewrite.
///
/// Every rewrite attempt gets a fresh name, so two rewrites never share a
/// staging table even across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagingTable(String);

impl StagingTable {
    pub const PREFIX: &'static str = "##reclaim_";

    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        quote(&self.0)
    }
}

impl fmt::Display for StagingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
