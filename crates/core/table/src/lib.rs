//! In-memory tabular data model.
//!
//! A [`Table`] is a validated [`RecordBatch`] whose column types belong to the closed
//! [`ColumnType`] set. Types are resolved once at construction; row access goes through the
//! resolved types instead of inspecting Arrow types per value.

use std::sync::Arc;

use arrow::{
    array::{ArrayRef, RecordBatch, RecordBatchOptions, new_null_array},
    compute::{CastOptions, cast_with_options, concat_batches},
    datatypes::{Field, Schema, SchemaRef, TimeUnit},
    error::ArrowError,
    util::display::FormatOptions,
};

mod column_type;
pub mod partition;
mod sanitize;
mod value;

pub use self::{
    column_type::{ColumnType, TypeFamily, UTC, UnsupportedTypeError},
    partition::{
        ChunkTarget, HIVE_DEFAULT_PARTITION, PartitionChunk, PartitionError, PartitionValues,
        Partitioner,
    },
    sanitize::{sanitize_column_name, sanitize_table_name},
    value::Value,
};

/// A named, typed column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    fn to_field(&self) -> Field {
        Field::new(&self.name, self.ty.to_arrow(), true)
    }
}

/// Builds an Arrow schema from column declarations. All fields are nullable.
pub fn schema_from_defs(defs: &[ColumnDef]) -> SchemaRef {
    Arc::new(Schema::new(
        defs.iter().map(ColumnDef::to_field).collect::<Vec<_>>(),
    ))
}

/// An ordered sequence of named, typed columns of equal length.
#[derive(Debug, Clone)]
pub struct Table {
    batch: RecordBatch,
    types: Arc<[ColumnType]>,
}

impl Table {
    /// Validates a record batch.
    ///
    /// Timestamps of a unit other than microseconds are converted to microseconds; zoned
    /// timestamps are re-tagged as UTC. Every other type must already be one of the supported
    /// column types.
    pub fn try_new(batch: RecordBatch) -> Result<Self, TableError> {
        let schema = batch.schema();
        let mut types = Vec::with_capacity(schema.fields().len());
        let mut needs_normalization = false;
        for field in schema.fields() {
            let ty = ColumnType::try_from_arrow(field.data_type()).map_err(|source| {
                TableError::UnsupportedType {
                    column: field.name().clone(),
                    source,
                }
            })?;
            needs_normalization |= field.data_type() != &ty.to_arrow();
            types.push(ty);
        }

        let batch = if needs_normalization {
            normalize_timestamps(&batch, &types)?
        } else {
            batch
        };

        Ok(Self {
            batch,
            types: types.into(),
        })
    }

    /// Builds a table from `(name, array)` pairs.
    pub fn from_columns(
        columns: impl IntoIterator<Item = (impl Into<String>, ArrayRef)>,
    ) -> Result<Self, TableError> {
        let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = columns
            .into_iter()
            .map(|(name, array)| (Field::new(name, array.data_type().clone(), true), array))
            .unzip();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .map_err(TableError::InvalidBatch)?;
        Self::try_new(batch)
    }

    /// An empty table with the given columns.
    pub fn empty(defs: &[ColumnDef]) -> Self {
        let schema = schema_from_defs(defs);
        Self {
            batch: RecordBatch::new_empty(schema),
            types: defs.iter().map(|def| def.ty).collect(),
        }
    }

    /// A table of `num_rows` rows where every column is null.
    pub fn nulls(defs: &[ColumnDef], num_rows: usize) -> Result<Self, TableError> {
        let schema = schema_from_defs(defs);
        let arrays = defs
            .iter()
            .map(|def| new_null_array(&def.ty.to_arrow(), num_rows))
            .collect();
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        let batch = RecordBatch::try_new_with_options(schema, arrays, &options)
            .map_err(TableError::InvalidBatch)?;
        Ok(Self {
            batch,
            types: defs.iter().map(|def| def.ty).collect(),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.types
    }

    /// Column declarations, in column order.
    pub fn column_defs(&self) -> Vec<ColumnDef> {
        self.batch
            .schema()
            .fields()
            .iter()
            .zip(self.types.iter())
            .map(|(field, ty)| ColumnDef::new(field.name(), *ty))
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.batch.schema().index_of(name).ok()
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.index_of(name).map(|idx| self.batch.column(idx))
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.index_of(name).map(|idx| self.types[idx])
    }

    /// The value at (`row`, `column`).
    ///
    /// # Panics
    ///
    /// Panics if either index is out of bounds.
    pub fn value(&self, row: usize, column: usize) -> Value {
        Value::from_array(self.batch.column(column).as_ref(), self.types[column], row)
    }

    /// All values of one row, in column order.
    pub fn row(&self, row: usize) -> Vec<Value> {
        (0..self.num_columns())
            .map(|column| self.value(row, column))
            .collect()
    }

    /// Iterates over every row of the table.
    pub fn rows(&self) -> impl Iterator<Item = Vec<Value>> + '_ {
        (0..self.num_rows()).map(|row| self.row(row))
    }

    /// Estimated in-memory size of the table data, in bytes.
    pub fn memory_size(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    /// Zero-copy slice of `length` rows starting at `offset`.
    pub fn slice(&self, offset: usize, length: usize) -> Table {
        Self {
            batch: self.batch.slice(offset, length),
            types: self.types.clone(),
        }
    }

    /// Selects columns by name, in the given order.
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<Table, SchemaMismatchError> {
        let indices = names
            .iter()
            .map(|name| {
                self.index_of(name.as_ref())
                    .ok_or_else(|| SchemaMismatchError::UnknownColumn {
                        column: name.as_ref().to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.project_indices(&indices)
    }

    /// Removes the named columns. Names that do not exist are ignored.
    pub fn drop_columns<S: AsRef<str>>(&self, names: &[S]) -> Table {
        let indices: Vec<usize> = self
            .batch
            .schema()
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, field)| !names.iter().any(|name| name.as_ref() == field.name()))
            .map(|(idx, _)| idx)
            .collect();
        // Indices come from the batch's own schema
        self.project_indices(&indices)
            .unwrap_or_else(|_| self.clone())
    }

    fn project_indices(&self, indices: &[usize]) -> Result<Table, SchemaMismatchError> {
        let batch = self
            .batch
            .project(indices)
            .map_err(|source| SchemaMismatchError::Cast {
                column: self.column_names().join(","),
                chunk: None,
                source,
            })?;
        Ok(Self {
            batch,
            types: indices.iter().map(|idx| self.types[*idx]).collect(),
        })
    }

    /// Appends a column at the end of the table.
    pub fn with_column(
        &self,
        name: impl Into<String>,
        array: ArrayRef,
    ) -> Result<Table, TableError> {
        let schema = self.batch.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new(name, array.data_type().clone(), true));
        let mut columns = self.batch.columns().to_vec();
        columns.push(array);
        let options = RecordBatchOptions::new().with_row_count(Some(self.num_rows()));
        let batch =
            RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
                .map_err(TableError::InvalidBatch)?;
        Self::try_new(batch)
    }

    /// Converts the table to the given column declarations.
    ///
    /// The output holds exactly the declared columns, in declaration order. Every declared
    /// column must exist in the table; values are converted with a strict cast, so a value that
    /// cannot be represented in the declared type fails the whole conversion. `chunk` names the
    /// data source for error reporting.
    pub fn cast_to(
        &self,
        defs: &[ColumnDef],
        chunk: Option<&str>,
    ) -> Result<Table, SchemaMismatchError> {
        let options = CastOptions {
            safe: false,
            format_options: FormatOptions::default(),
        };
        let mut arrays = Vec::with_capacity(defs.len());
        for def in defs {
            let source = self
                .column(&def.name)
                .ok_or_else(|| SchemaMismatchError::MissingColumn {
                    column: def.name.clone(),
                })?;
            let target = def.ty.to_arrow();
            let array = if source.data_type() == &target {
                source.clone()
            } else {
                cast_with_options(source, &target, &options).map_err(|source| {
                    SchemaMismatchError::Cast {
                        column: def.name.clone(),
                        chunk: chunk.map(str::to_string),
                        source,
                    }
                })?
            };
            arrays.push(array);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(self.num_rows()));
        let batch = RecordBatch::try_new_with_options(schema_from_defs(defs), arrays, &options)
            .map_err(|source| SchemaMismatchError::Cast {
                column: String::new(),
                chunk: chunk.map(str::to_string),
                source,
            })?;
        Ok(Self {
            batch,
            types: defs.iter().map(|def| def.ty).collect(),
        })
    }

    /// Concatenates tables sharing the same column declarations.
    ///
    /// Returns `None` when `tables` is empty.
    pub fn concat(tables: &[Table]) -> Result<Option<Table>, SchemaMismatchError> {
        let Some(first) = tables.first() else {
            return Ok(None);
        };
        let defs = first.column_defs();
        if let Some(other) = tables.iter().find(|t| t.column_defs() != defs) {
            let other_defs = other.column_defs();
            let position = defs
                .iter()
                .zip(other_defs.iter())
                .position(|(a, b)| a != b)
                .unwrap_or(defs.len().min(other_defs.len()));
            let column = defs
                .get(position)
                .or_else(|| other_defs.get(position))
                .map(|def| def.name.clone())
                .unwrap_or_default();
            return Err(SchemaMismatchError::Concat { column });
        }

        let schema = first.schema();
        let batch = concat_batches(&schema, tables.iter().map(|t| &t.batch)).map_err(|source| {
            SchemaMismatchError::Cast {
                column: String::new(),
                chunk: None,
                source,
            }
        })?;
        Ok(Some(Self {
            batch,
            types: first.types.clone(),
        }))
    }

    pub fn as_record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }
}

impl TryFrom<RecordBatch> for Table {
    type Error = TableError;

    fn try_from(batch: RecordBatch) -> Result<Self, Self::Error> {
        Self::try_new(batch)
    }
}

fn normalize_timestamps(
    batch: &RecordBatch,
    types: &[ColumnType],
) -> Result<RecordBatch, TableError> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(types.len());
    let mut columns = Vec::with_capacity(types.len());
    for ((field, column), ty) in schema.fields().iter().zip(batch.columns()).zip(types) {
        let target = ty.to_arrow();
        if column.data_type() == &target {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
            continue;
        }
        debug_assert!(matches!(
            column.data_type(),
            arrow::datatypes::DataType::Timestamp(
                TimeUnit::Second
                    | TimeUnit::Millisecond
                    | TimeUnit::Microsecond
                    | TimeUnit::Nanosecond,
                _
            )
        ));
        let converted = arrow::compute::cast(column, &target).map_err(|source| {
            TableError::Normalize {
                column: field.name().clone(),
                source,
            }
        })?;
        fields.push(field.as_ref().clone().with_data_type(target));
        columns.push(converted);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
        .map_err(TableError::InvalidBatch)
}

/// Errors raised while constructing a [`Table`].
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// A column has a type outside the supported set.
    #[error("column '{column}' has an unsupported type")]
    UnsupportedType {
        column: String,
        #[source]
        source: UnsupportedTypeError,
    },

    /// The columns do not form a valid record batch (e.g. unequal lengths).
    #[error("invalid record batch")]
    InvalidBatch(#[source] ArrowError),

    /// A timestamp column could not be converted to microsecond precision.
    #[error("failed to normalize timestamp column '{column}'")]
    Normalize {
        column: String,
        #[source]
        source: ArrowError,
    },
}

/// Data does not match the expected schema.
///
/// Every variant names the offending column. Decoding errors also name the chunk (the file) the
/// data came from; individual rows are never reported.
#[derive(Debug, thiserror::Error)]
pub enum SchemaMismatchError {
    /// A declared column is absent from the data.
    #[error("column '{column}' is missing")]
    MissingColumn { column: String },

    /// The data holds a column the declared schema does not know about.
    #[error("column '{column}' is not declared in the target schema")]
    UndeclaredColumn { column: String },

    /// A requested column does not exist.
    #[error("column '{column}' does not exist")]
    UnknownColumn { column: String },

    /// The column's type family differs from the declared one, or it would narrow.
    #[error("column '{column}' of type {actual} is incompatible with declared type {declared}")]
    IncompatibleType {
        column: String,
        declared: ColumnType,
        actual: ColumnType,
    },

    /// Values could not be converted to the declared type.
    #[error("failed to convert column '{column}'{}", chunk_suffix(.chunk))]
    Cast {
        column: String,
        chunk: Option<String>,
        #[source]
        source: ArrowError,
    },

    /// Tables being concatenated disagree on a column.
    #[error("cannot concatenate tables: column '{column}' differs")]
    Concat { column: String },
}

impl SchemaMismatchError {
    /// The name of the offending column.
    pub fn column(&self) -> &str {
        match self {
            Self::MissingColumn { column }
            | Self::UndeclaredColumn { column }
            | Self::UnknownColumn { column }
            | Self::IncompatibleType { column, .. }
            | Self::Cast { column, .. }
            | Self::Concat { column } => column,
        }
    }

    /// The chunk the data came from, when known.
    pub fn chunk(&self) -> Option<&str> {
        match self {
            Self::Cast { chunk, .. } => chunk.as_deref(),
            _ => None,
        }
    }
}

fn chunk_suffix(chunk: &Option<String>) -> String {
    chunk
        .as_deref()
        .map(|chunk| format!(" in chunk '{chunk}'"))
        .unwrap_or_default()
}
