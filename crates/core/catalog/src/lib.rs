//! Table catalog access.
//!
//! The catalog is an external service holding, for every table, its column declarations, storage
//! location, partition keys and free-form parameters, plus the list of registered partitions.
//! [`CatalogService`] is the narrow protocol the engine speaks to it; [`CatalogSynchronizer`]
//! implements the pre-write compatibility checks and post-write registration on top of it.

use std::collections::BTreeMap;

use lakeshift_executor::ServiceError;
use lakeshift_table::{ColumnDef, HIVE_DEFAULT_PARTITION, PartitionValues};

mod memory;
mod sync;
mod table_ref;

pub use self::{
    memory::InMemoryCatalog,
    sync::{
        CatalogInconsistencyError, CatalogSnapshot, CatalogSynchronizer, Inconsistency,
        Registration, SyncError, check_layout, conform, describe,
    },
    table_ref::{TableRef, TableRefError},
};

/// Table parameter naming the file format of a table's objects.
pub const CLASSIFICATION: &str = "classification";

/// A table's catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogTable {
    pub name: TableRef,
    /// Data columns, in storage order. Partition keys are not included.
    pub columns: Vec<ColumnDef>,
    pub partition_keys: Vec<ColumnDef>,
    /// Storage URL of the table's root prefix, with a trailing slash.
    pub location: String,
    pub parameters: BTreeMap<String, String>,
}

impl CatalogTable {
    /// The file format classification, e.g. `parquet` or `csv`.
    pub fn classification(&self) -> Option<&str> {
        self.parameters.get(CLASSIFICATION).map(String::as_str)
    }

    /// Every declared column: data columns followed by partition keys.
    pub fn all_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().chain(self.partition_keys.iter())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.all_columns().find(|def| def.name == name)
    }

    pub fn partition_key_names(&self) -> Vec<String> {
        self.partition_keys.iter().map(|def| def.name.clone()).collect()
    }
}

/// A registered partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPartition {
    /// Values in partition key order. Nulls are stored as [`HIVE_DEFAULT_PARTITION`].
    pub values: Vec<String>,
    /// Storage URL of the partition prefix, with a trailing slash.
    pub location: String,
}

impl CatalogPartition {
    /// Builds the catalog record of a written partition.
    pub fn from_values(values: &PartitionValues, location: impl Into<String>) -> Self {
        Self {
            values: values
                .texts()
                .into_iter()
                .map(|text| text.unwrap_or_else(|| HIVE_DEFAULT_PARTITION.to_string()))
                .collect(),
            location: location.into(),
        }
    }
}

/// The catalog protocol.
///
/// Implementations talk to a managed catalog service; [`InMemoryCatalog`] keeps everything in
/// process memory.
#[async_trait::async_trait]
pub trait CatalogService: Send + Sync + std::fmt::Debug {
    /// Fetches a table entry. Returns `None` if the table does not exist.
    async fn get_table(&self, table: &TableRef) -> Result<Option<CatalogTable>, CatalogError>;

    /// Lists the partitions registered for a table.
    async fn get_partitions(&self, table: &TableRef)
    -> Result<Vec<CatalogPartition>, CatalogError>;

    /// Creates a table entry. Fails if the table exists.
    async fn create_table(&self, table: CatalogTable) -> Result<(), CatalogError>;

    /// Replaces a table entry, keeping its partitions. Fails if the table does not exist.
    async fn update_table(&self, table: CatalogTable) -> Result<(), CatalogError>;

    /// Deletes a table entry and all of its partitions. Fails if the table does not exist.
    async fn delete_table(&self, table: &TableRef) -> Result<(), CatalogError>;

    /// Registers partitions. A partition already registered with the same values is replaced.
    async fn batch_create_partitions(
        &self,
        table: &TableRef,
        partitions: Vec<CatalogPartition>,
    ) -> Result<(), CatalogError>;

    /// Removes the partitions with the given values. Unknown values are ignored.
    async fn batch_delete_partitions(
        &self,
        table: &TableRef,
        values: Vec<Vec<String>>,
    ) -> Result<(), CatalogError>;
}

/// Errors returned by [`CatalogService`] calls.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The table does not exist.
    #[error("table '{0}' does not exist")]
    TableNotFound(TableRef),

    /// The table already exists.
    #[error("table '{0}' already exists")]
    TableAlreadyExists(TableRef),

    /// A partition does not match the table's partition keys.
    #[error("partition {values:?} of table '{table}' does not match its {expected} partition keys")]
    InvalidPartition {
        table: TableRef,
        values: Vec<String>,
        expected: usize,
    },

    /// The catalog service call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::TableNotFound(_))
    }
}
