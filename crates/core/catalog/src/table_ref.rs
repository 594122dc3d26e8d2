//! Qualified catalog table names.

use lakeshift_table::sanitize_table_name;

/// A `database.table` name.
///
/// Both parts must be non-empty and consist only of lowercase ASCII letters, digits and
/// underscores, the character set the catalog accepts. Use [`TableRef::sanitized`] to derive a
/// valid name from arbitrary input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    database: String,
    table: String,
}

impl TableRef {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, TableRefError> {
        let database = database.into();
        let table = table.into();
        validate_part(&database)?;
        validate_part(&table)?;
        Ok(Self { database, table })
    }

    /// Builds a name from arbitrary input, sanitizing both parts.
    pub fn sanitized(database: &str, table: &str) -> Result<Self, TableRefError> {
        Self::new(sanitize_table_name(database), sanitize_table_name(table))
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

impl std::str::FromStr for TableRef {
    type Err = TableRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (database, table) = s
            .split_once('.')
            .ok_or_else(|| TableRefError::Unqualified(s.to_string()))?;
        Self::new(database, table)
    }
}

fn validate_part(part: &str) -> Result<(), TableRefError> {
    if part.is_empty() {
        return Err(TableRefError::Empty);
    }
    if let Some(c) = part
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(TableRefError::InvalidCharacter {
            name: part.to_string(),
            character: c,
        });
    }
    Ok(())
}

/// Errors raised when building a [`TableRef`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableRefError {
    /// The name has no `database.` qualifier.
    #[error("table name '{0}' is not qualified with a database")]
    Unqualified(String),

    /// The database or table part is empty.
    #[error("database and table names must not be empty")]
    Empty,

    /// The name contains a character the catalog does not accept.
    #[error("name '{name}' contains invalid character '{character}'")]
    InvalidCharacter { name: String, character: char },
}
