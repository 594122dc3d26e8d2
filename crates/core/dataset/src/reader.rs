//! Dataset read path.
//!
//! Lists the objects under a location, fetches and decodes them in parallel, re-attaches the
//! partition columns encoded in their `col=value` path segments and concatenates the result.

use std::{collections::BTreeMap, sync::Arc};

use arrow::array::{ArrayRef, StringArray};
use lakeshift_catalog::{CatalogSynchronizer, SyncError, TableRef};
use lakeshift_codec::{
    CsvOptions, DecodeError, DecodeOptions, FormatKind, Predicate, ReadFormat, filter,
};
use lakeshift_executor::{BoxError, Executor, ServiceError};
use lakeshift_object_store::{InvalidPathError, StorageUrl};
use lakeshift_table::{
    ColumnDef, ColumnType, SchemaMismatchError, Table, TableError,
    partition::parse_partition_segment,
};
use object_store::path::Path;

use crate::writer::{FIELD_DELIMITER, HEADER_LINE_COUNT};

/// Options of one read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// How to decode the objects. `None` reads Parquet objects, detected by extension.
    pub format: Option<ReadFormat>,
    /// Columns to return, in output order. Partition columns may be included. `None` returns
    /// the data columns followed by the partition columns.
    pub columns: Option<Vec<String>>,
    /// Conjunction of row predicates. Predicates on partition columns prune whole objects.
    pub filters: Vec<Predicate>,
    /// Types of partition columns. Partition columns without a type are read as text.
    pub partition_types: BTreeMap<String, ColumnType>,
}

/// An object of a dataset and the partition it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetObject {
    pub location: Path,
    /// Partition column values parsed from the path, in path order. `None` for nulls.
    pub partition: Vec<(String, Option<String>)>,
}

/// Reads datasets written by [`DatasetWriter`](crate::DatasetWriter) or by other tools using
/// the same Hive-style layout.
#[derive(Debug, Clone)]
pub struct DatasetReader {
    executor: Executor,
    catalog: Option<CatalogSynchronizer>,
}

impl DatasetReader {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: CatalogSynchronizer) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Lists the data objects under `location` with their partition values.
    ///
    /// Objects whose file name starts with `_` or `.` (markers, temporary files) are skipped.
    /// Without an explicit `format` only objects with a Parquet extension are listed.
    pub async fn list_objects(
        &self,
        location: &str,
        format: Option<&ReadFormat>,
    ) -> Result<Vec<DatasetObject>, ReadError> {
        let prefix = StorageUrl::new(location)?.object_path()?;
        let listed = self.executor.list(&prefix).await?;

        let mut objects = Vec::with_capacity(listed.len());
        for meta in listed {
            let Some(parts) = meta.location.prefix_match(&prefix) else {
                continue;
            };
            let parts: Vec<String> = parts.map(|part| part.as_ref().to_string()).collect();
            let Some((file_name, dirs)) = parts.split_last() else {
                continue;
            };
            if file_name.starts_with('_') || file_name.starts_with('.') {
                continue;
            }
            if format.is_none() {
                match FormatKind::detect(file_name) {
                    Some(FormatKind::Parquet) => {}
                    Some(FormatKind::Csv) => {
                        return Err(ReadError::CsvSchemaRequired {
                            key: meta.location.to_string(),
                        });
                    }
                    None => continue,
                }
            }
            let partition = dirs
                .iter()
                .filter_map(|dir| parse_partition_segment(dir))
                .collect();
            objects.push(DatasetObject {
                location: meta.location,
                partition,
            });
        }
        Ok(objects)
    }

    /// Total size in bytes of every object under `location`.
    pub async fn size(&self, location: &str) -> Result<u64, ReadError> {
        let prefix = StorageUrl::new(location)?.object_path()?;
        let listed = self.executor.list(&prefix).await?;
        Ok(listed.iter().map(|meta| meta.size).sum())
    }

    /// Reads every object under `location` into one table.
    #[tracing::instrument(skip_all, fields(location = %location), err)]
    pub async fn read(&self, location: &str, options: &ReadOptions) -> Result<Table, ReadError> {
        let objects = self
            .list_objects(location, options.format.as_ref())
            .await?;
        self.read_objects(location, objects, options).await
    }

    /// Reads the objects at `locations` into one table.
    ///
    /// Every location names a single object, read as Parquet unless `options.format` says
    /// otherwise. Partition columns are taken from `col=value` segments of each path; all paths
    /// must carry the same partition columns.
    #[tracing::instrument(skip_all, fields(objects = locations.len()), err)]
    pub async fn read_paths(
        &self,
        locations: &[String],
        options: &ReadOptions,
    ) -> Result<Table, ReadError> {
        if locations.is_empty() {
            return Err(ReadError::NoPaths);
        }
        let objects = locations
            .iter()
            .map(|location| {
                let path = StorageUrl::new(location)?.object_path()?;
                let partition = path
                    .parts()
                    .collect::<Vec<_>>()
                    .split_last()
                    .map(|(_, dirs)| {
                        dirs.iter()
                            .filter_map(|dir| parse_partition_segment(dir.as_ref()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(DatasetObject {
                    location: path,
                    partition,
                })
            })
            .collect::<Result<Vec<_>, ReadError>>()?;
        self.read_objects(&locations.join(", "), objects, options)
            .await
    }

    async fn read_objects(
        &self,
        location: &str,
        mut objects: Vec<DatasetObject>,
        options: &ReadOptions,
    ) -> Result<Table, ReadError> {
        let partition_keys: Vec<String> = objects
            .first()
            .map(|object| object.partition.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default();
        if let Some(object) = objects.iter().find(|object| {
            object.partition.len() != partition_keys.len()
                || object
                    .partition
                    .iter()
                    .zip(&partition_keys)
                    .any(|((name, _), key)| name != key)
        }) {
            return Err(ReadError::InconsistentPartitions {
                key: object.location.to_string(),
            });
        }

        let (partition_filters, data_filters): (Vec<Predicate>, Vec<Predicate>) = options
            .filters
            .iter()
            .cloned()
            .partition(|predicate| partition_keys.iter().any(|key| key == predicate.column()));
        if !partition_filters.is_empty() {
            let mut kept = Vec::with_capacity(objects.len());
            for object in objects {
                if partition_matches(&object, &options.partition_types, &partition_filters)? {
                    kept.push(object);
                }
            }
            objects = kept;
        }
        if objects.is_empty() {
            return Err(ReadError::NoObjects {
                location: location.to_string(),
            });
        }

        let decode = DecodeOptions {
            columns: options.columns.as_ref().map(|columns| {
                columns
                    .iter()
                    .filter(|column| !partition_keys.contains(column))
                    .cloned()
                    .collect()
            }),
            filters: data_filters,
        };
        let attach: Vec<String> = match &options.columns {
            Some(columns) => partition_keys
                .iter()
                .filter(|key| columns.contains(key))
                .cloned()
                .collect(),
            None => partition_keys.clone(),
        };
        let format = options.format.clone().unwrap_or(ReadFormat::Parquet);
        let object_count = objects.len();

        let outcome = self
            .executor
            .run_batch(
                objects,
                |object| format!("read '{}'", object.location),
                |object| {
                    let format = format.clone();
                    let decode = decode.clone();
                    let attach = attach.clone();
                    let types = options.partition_types.clone();
                    async move {
                        let key = object.location.to_string();
                        let bytes = self
                            .executor
                            .client()
                            .get(&object.location)
                            .await
                            .map_err(|err| ServiceError::from_store(format!("get '{key}'"), err))?;
                        self.executor
                            .spawn_blocking("decode object", move || {
                                let table = format.decode(&key, bytes, &decode)?;
                                attach_partition_columns(table, &object, &attach, &types, &key)
                                    .map_err(BoxError::from)
                            })
                            .await
                    }
                },
            )
            .await;

        if let Some(failure) = outcome.failed.into_iter().next() {
            return Err(ReadError::Object {
                key: failure.task.location.to_string(),
                source: failure.error,
            });
        }
        if !outcome.cancelled.is_empty() {
            return Err(ReadError::Cancelled {
                pending: outcome.cancelled.len(),
            });
        }

        let mut tables = outcome.succeeded;
        tables.sort_by(|(a, _), (b, _)| a.location.cmp(&b.location));
        let tables: Vec<Table> = tables.into_iter().map(|(_, table)| table).collect();
        let table = Table::concat(&tables)?.ok_or_else(|| ReadError::NoObjects {
            location: location.to_string(),
        })?;
        let table = match &options.columns {
            Some(columns) => table.project(columns)?,
            None => table,
        };

        tracing::debug!(objects = object_count, rows = table.num_rows(), "read dataset");
        Ok(table)
    }

    /// Reads a catalog table.
    ///
    /// The format, column types of delimited text and partition column types come from the
    /// catalog entry; explicit entries in `options.partition_types` take precedence.
    pub async fn read_table(
        &self,
        name: &TableRef,
        options: &ReadOptions,
    ) -> Result<Table, ReadError> {
        let sync = self.catalog.as_ref().ok_or(ReadError::NoCatalog)?;
        let snapshot = sync
            .fetch(name)
            .await
            .map_err(ReadError::Catalog)?
            .ok_or_else(|| ReadError::TableNotFound(name.clone()))?;
        let entry = snapshot.table;

        let format = match entry.classification() {
            None | Some("parquet") => ReadFormat::Parquet,
            Some("csv") => {
                let defaults = CsvOptions::default();
                ReadFormat::Csv {
                    schema: entry.columns.clone(),
                    options: CsvOptions {
                        delimiter: entry
                            .parameters
                            .get(FIELD_DELIMITER)
                            .and_then(|d| d.bytes().next())
                            .unwrap_or(defaults.delimiter),
                        header: entry
                            .parameters
                            .get(HEADER_LINE_COUNT)
                            .is_none_or(|count| count != "0"),
                        ..defaults
                    },
                }
            }
            Some(other) => return Err(ReadError::UnsupportedClassification(other.to_string())),
        };

        let mut options = options.clone();
        options.format = Some(format);
        for key in &entry.partition_keys {
            options
                .partition_types
                .entry(key.name.clone())
                .or_insert(key.ty);
        }
        self.read(&entry.location, &options).await
    }
}

fn partition_table(
    object: &DatasetObject,
    columns: &[String],
    types: &BTreeMap<String, ColumnType>,
    num_rows: usize,
    key: &str,
) -> Result<Table, ReadError> {
    let mut text_columns = Vec::with_capacity(columns.len());
    let mut defs = Vec::with_capacity(columns.len());
    for column in columns {
        let value = object
            .partition
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref());
        let array = StringArray::from(vec![value; num_rows]);
        text_columns.push((column.clone(), Arc::new(array) as ArrayRef));
        let ty = types.get(column).copied().unwrap_or(ColumnType::Utf8);
        defs.push(ColumnDef::new(column.clone(), ty));
    }
    let text = if text_columns.is_empty() {
        Table::nulls(&[], num_rows)?
    } else {
        Table::from_columns(text_columns)?
    };
    Ok(text.cast_to(&defs, Some(key))?)
}

fn attach_partition_columns(
    table: Table,
    object: &DatasetObject,
    columns: &[String],
    types: &BTreeMap<String, ColumnType>,
    key: &str,
) -> Result<Table, ReadError> {
    if columns.is_empty() {
        return Ok(table);
    }
    let values = partition_table(object, columns, types, table.num_rows(), key)?;
    let mut table = table;
    for column in columns {
        if let Some(array) = values.column(column) {
            table = table.with_column(column.clone(), array.clone())?;
        }
    }
    Ok(table)
}

fn partition_matches(
    object: &DatasetObject,
    types: &BTreeMap<String, ColumnType>,
    filters: &[Predicate],
) -> Result<bool, ReadError> {
    let columns: Vec<String> = object.partition.iter().map(|(name, _)| name.clone()).collect();
    let key = object.location.to_string();
    let values = partition_table(object, &columns, types, 1, &key)?;
    let mask = filter::evaluate_all(filters, values.as_record_batch())
        .map_err(|source| ReadError::Filter { key, source })?;
    Ok(mask.is_none_or(|mask| mask.value(0)))
}

/// Errors raised while reading a dataset.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The location is not a valid storage URI.
    #[error(transparent)]
    InvalidPath(#[from] InvalidPathError),

    /// Listing the location failed.
    #[error("failed to list dataset objects")]
    List(#[from] ServiceError),

    /// No objects to read were found.
    #[error("no objects to read under '{location}'")]
    NoObjects { location: String },

    /// An empty list of object locations was given.
    #[error("no object locations to read")]
    NoPaths,

    /// Delimited text objects were found but no schema was given.
    #[error("object '{key}' is delimited text, which requires an explicit schema")]
    CsvSchemaRequired { key: String },

    /// Objects of the dataset are partitioned by different columns.
    #[error("partition columns of object '{key}' differ from the rest of the dataset")]
    InconsistentPartitions { key: String },

    /// An object could not be fetched or decoded.
    #[error("failed to read object '{key}'")]
    Object {
        key: String,
        #[source]
        source: ServiceError,
    },

    /// The read was cancelled before every object was read.
    #[error("read cancelled with {pending} objects unread")]
    Cancelled { pending: usize },

    /// Decoded objects or partition values do not fit together.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),

    /// Partition values could not be assembled into a table.
    #[error("failed to assemble partition columns")]
    Table(#[from] TableError),

    /// A partition predicate could not be evaluated.
    #[error("failed to evaluate partition filter for '{key}'")]
    Filter {
        key: String,
        #[source]
        source: arrow::error::ArrowError,
    },

    /// A catalog table was requested but no catalog is configured.
    #[error("no catalog is configured")]
    NoCatalog,

    /// The catalog table does not exist.
    #[error("table '{0}' does not exist")]
    TableNotFound(TableRef),

    /// The catalog could not be read.
    #[error("failed to read catalog")]
    Catalog(#[source] SyncError),

    /// The catalog table's format is not supported.
    #[error("unsupported table classification '{0}'")]
    UnsupportedClassification(String),
}

impl ReadError {
    /// The decoding error behind a failed object read, if decoding was what failed.
    pub fn decode_error(&self) -> Option<&DecodeError> {
        let ReadError::Object { source, .. } = self else {
            return None;
        };
        std::error::Error::source(source)?.downcast_ref::<DecodeError>()
    }
}
