//! Catalog consistency around writes.
//!
//! Before a write, the synchronizer fetches the existing entry (if any) so the writer can check
//! the write against it and conform the data to the declared column types. After all objects of
//! a write are stored, it registers the table and its partitions.
//!
//! Registration is not atomic across concurrent writers: two jobs registering the same table
//! may overwrite each other's partition records. No locking is attempted; the catalog is
//! eventually consistent with the objects in storage.

use std::{collections::BTreeMap, sync::Arc};

use lakeshift_table::{ColumnDef, SchemaMismatchError, Table};

use crate::{
    CLASSIFICATION, CatalogError, CatalogPartition, CatalogService, CatalogTable, TableRef,
};

/// A table entry with its registered partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSnapshot {
    pub table: CatalogTable,
    pub partitions: Vec<CatalogPartition>,
}

/// What a finished write registers.
#[derive(Debug, Clone)]
pub struct Registration {
    pub table: CatalogTable,
    /// Partitions the write stored objects under. Empty for unpartitioned tables.
    pub partitions: Vec<CatalogPartition>,
    /// Replace the entry wholesale, dropping partitions the write did not produce.
    pub replace: bool,
}

/// Coordinates catalog metadata with the objects a write stores.
#[derive(Debug, Clone)]
pub struct CatalogSynchronizer {
    service: Arc<dyn CatalogService>,
}

impl CatalogSynchronizer {
    pub fn new(service: Arc<dyn CatalogService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<dyn CatalogService> {
        &self.service
    }

    /// Fetches a table entry and its partitions. Returns `None` if the table does not exist.
    #[tracing::instrument(skip_all, fields(table = %table), err)]
    pub async fn fetch(&self, table: &TableRef) -> Result<Option<CatalogSnapshot>, SyncError> {
        let Some(entry) = self.service.get_table(table).await? else {
            return Ok(None);
        };
        let partitions = if entry.partition_keys.is_empty() {
            Vec::new()
        } else {
            self.service.get_partitions(table).await?
        };
        Ok(Some(CatalogSnapshot {
            table: entry,
            partitions,
        }))
    }

    pub async fn does_table_exist(&self, table: &TableRef) -> Result<bool, SyncError> {
        Ok(self.service.get_table(table).await?.is_some())
    }

    /// Deletes a table entry. Returns whether the table existed.
    pub async fn delete_table_if_exists(&self, table: &TableRef) -> Result<bool, SyncError> {
        match self.service.delete_table(table).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Registers a finished write.
    ///
    /// A missing table is created. With [`Registration::replace`] an existing entry is replaced
    /// and partitions the write did not produce are deregistered; otherwise the existing entry
    /// is kept and the written partitions are added to it.
    #[tracing::instrument(skip_all, fields(table = %registration.table.name), err)]
    pub async fn register(&self, registration: Registration) -> Result<(), SyncError> {
        let Registration {
            table,
            partitions,
            replace,
        } = registration;
        let name = table.name.clone();

        match self.service.get_table(&name).await? {
            None => match self.service.create_table(table).await {
                Ok(()) => tracing::info!(table = %name, "registered table"),
                Err(CatalogError::TableAlreadyExists(_)) => {
                    tracing::warn!(table = %name, "table was registered concurrently");
                }
                Err(err) => return Err(err.into()),
            },
            Some(existing) if replace => {
                self.service.update_table(table).await?;
                if !existing.partition_keys.is_empty() {
                    let stale = self
                        .service
                        .get_partitions(&name)
                        .await?
                        .into_iter()
                        .filter(|old| !partitions.iter().any(|new| new.values == old.values))
                        .map(|old| old.values)
                        .collect::<Vec<_>>();
                    if !stale.is_empty() {
                        tracing::debug!(
                            table = %name,
                            count = stale.len(),
                            "deregistering stale partitions"
                        );
                        self.service.batch_delete_partitions(&name, stale).await?;
                    }
                }
                tracing::info!(table = %name, "replaced table");
            }
            Some(_) => {}
        }

        if !partitions.is_empty() {
            let count = partitions.len();
            self.service
                .batch_create_partitions(&name, partitions)
                .await?;
            tracing::debug!(table = %name, count, "registered partitions");
        }
        Ok(())
    }
}

/// Builds the catalog entry describing `table` stored at `location`.
///
/// `partition_columns` become partition keys, in the given order; every other column is a data
/// column. `classification` is recorded in the table parameters next to `parameters`.
pub fn describe(
    name: TableRef,
    table: &Table,
    partition_columns: &[String],
    location: &str,
    classification: &str,
    parameters: BTreeMap<String, String>,
) -> Result<CatalogTable, SchemaMismatchError> {
    let defs = table.column_defs();
    let partition_keys = partition_columns
        .iter()
        .map(|column| {
            defs.iter()
                .find(|def| &def.name == column)
                .cloned()
                .ok_or_else(|| SchemaMismatchError::UnknownColumn {
                    column: column.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let columns = defs
        .into_iter()
        .filter(|def| !partition_columns.contains(&def.name))
        .collect();

    let mut parameters = parameters;
    parameters.insert(CLASSIFICATION.to_string(), classification.to_string());

    Ok(CatalogTable {
        name,
        columns,
        partition_keys,
        location: with_trailing_slash(location),
        parameters,
    })
}

/// Checks incoming data against a declared entry and converts it to the declared types.
///
/// Columns are matched by name. A column of a narrower type within the same family is widened
/// to the declared type with a warning; a column of another family, a column the entry does not
/// declare, or a declared column absent from the data is a [`SchemaMismatchError`]. The output
/// holds the declared data columns followed by the partition keys.
pub fn conform(declared: &CatalogTable, incoming: &Table) -> Result<Table, SchemaMismatchError> {
    for def in incoming.column_defs() {
        let target = declared
            .column(&def.name)
            .ok_or_else(|| SchemaMismatchError::UndeclaredColumn {
                column: def.name.clone(),
            })?;
        match def.ty.coercible_to(&target.ty) {
            Some(true) => {}
            Some(false) => tracing::warn!(
                table = %declared.name,
                column = %def.name,
                from = %def.ty,
                to = %target.ty,
                "widening column to its declared type"
            ),
            None => {
                return Err(SchemaMismatchError::IncompatibleType {
                    column: def.name,
                    declared: target.ty,
                    actual: def.ty,
                });
            }
        }
    }
    let defs: Vec<ColumnDef> = declared.all_columns().cloned().collect();
    incoming.cast_to(&defs, None)
}

/// Checks that a write to `location` partitioned by `partition_columns` matches the layout of
/// the declared entry.
pub fn check_layout(
    declared: &CatalogTable,
    location: &str,
    partition_columns: &[String],
) -> Result<(), CatalogInconsistencyError> {
    let declared_keys = declared.partition_key_names();
    if declared_keys != partition_columns {
        return Err(CatalogInconsistencyError {
            table: declared.name.clone(),
            inconsistency: Inconsistency::PartitionKeys {
                declared: declared_keys,
                requested: partition_columns.to_vec(),
            },
        });
    }
    let requested = with_trailing_slash(location);
    if declared.location != requested {
        return Err(CatalogInconsistencyError {
            table: declared.name.clone(),
            inconsistency: Inconsistency::Location {
                declared: declared.location.clone(),
                requested,
            },
        });
    }
    Ok(())
}

fn with_trailing_slash(location: &str) -> String {
    if location.ends_with('/') {
        location.to_string()
    } else {
        format!("{location}/")
    }
}

/// The catalog entry of a table disagrees with the layout of a write.
#[derive(Debug, thiserror::Error)]
#[error("catalog entry of table '{table}' is inconsistent with the write: {inconsistency}")]
pub struct CatalogInconsistencyError {
    pub table: TableRef,
    pub inconsistency: Inconsistency,
}

/// How a catalog entry disagrees with a write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Inconsistency {
    #[error("declared partition keys {declared:?}, write partitions by {requested:?}")]
    PartitionKeys {
        declared: Vec<String>,
        requested: Vec<String>,
    },

    #[error("declared location '{declared}', write targets '{requested}'")]
    Location { declared: String, requested: String },
}

/// Errors raised by [`CatalogSynchronizer`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The catalog service call failed.
    #[error("catalog call failed")]
    Catalog(#[from] CatalogError),

    /// The catalog entry disagrees with the write.
    #[error(transparent)]
    Inconsistent(#[from] CatalogInconsistencyError),

    /// The data does not match the declared schema.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),
}
