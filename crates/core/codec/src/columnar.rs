//! Columnar (Parquet) chunk codec.

use std::sync::Arc;

use arrow::{compute::concat_batches, record_batch::RecordBatchReader as _};
use bytes::Bytes;
use lakeshift_table::{ColumnDef, Table};
use parquet::{
    arrow::{
        ArrowWriter, ProjectionMask,
        arrow_reader::{
            ArrowPredicate, ArrowPredicateFn, ParquetRecordBatchReaderBuilder, RowFilter,
        },
    },
    file::properties::WriterProperties,
};
use tracing::trace;

use crate::{DecodeError, DecodeOptions, EncodeError, ParquetCompression, filter::Predicate};

/// Rows decoded per record batch.
const READ_BATCH_SIZE: usize = 8192;

/// Encodes a table into a Parquet file.
pub fn encode(table: &Table, compression: ParquetCompression) -> Result<Bytes, EncodeError> {
    let props = WriterProperties::builder()
        .set_compression(compression.into())
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), table.schema(), Some(props))
        .map_err(EncodeError::Parquet)?;
    writer
        .write(table.as_record_batch())
        .map_err(EncodeError::Parquet)?;
    let buf = writer.into_inner().map_err(EncodeError::Parquet)?;
    trace!(rows = table.num_rows(), bytes = buf.len(), %compression, "encoded parquet chunk");
    Ok(Bytes::from(buf))
}

/// Decodes a Parquet file.
///
/// Only the wanted columns are decoded and the predicates run inside the reader, before the
/// remaining columns of a row are materialized. Integer columns come back as `Int64` and
/// `Float32` columns as `Float64`.
pub fn decode(chunk: &str, bytes: Bytes, options: &DecodeOptions) -> Result<Table, DecodeError> {
    let parquet_err = |source| DecodeError::Parquet {
        chunk: chunk.to_string(),
        source,
    };

    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(parquet_err)?;
    let file_schema = builder.schema().clone();
    let index_of = |column: &str| {
        file_schema
            .index_of(column)
            .map_err(|_| DecodeError::UnknownColumn {
                chunk: chunk.to_string(),
                column: column.to_string(),
            })
    };

    let mut builder = builder.with_batch_size(READ_BATCH_SIZE);

    if let Some(columns) = &options.columns {
        let indices = columns
            .iter()
            .map(|column| index_of(column))
            .collect::<Result<Vec<_>, _>>()?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        builder = builder.with_projection(mask);
    }

    if !options.filters.is_empty() {
        let mut predicates: Vec<Box<dyn ArrowPredicate>> =
            Vec::with_capacity(options.filters.len());
        for predicate in &options.filters {
            let idx = index_of(predicate.column())?;
            let mask = ProjectionMask::roots(builder.parquet_schema(), [idx]);
            let predicate: Predicate = predicate.clone();
            predicates.push(Box::new(ArrowPredicateFn::new(mask, move |batch| {
                predicate.evaluate(&batch)
            })));
        }
        builder = builder.with_row_filter(RowFilter::new(predicates));
    }

    let reader = builder.build().map_err(parquet_err)?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| DecodeError::Arrow {
            chunk: chunk.to_string(),
            source,
        })?;
    let batch = concat_batches(&schema, &batches).map_err(|source| DecodeError::Arrow {
        chunk: chunk.to_string(),
        source,
    })?;

    let table = Table::try_new(batch).map_err(|source| DecodeError::Table {
        chunk: chunk.to_string(),
        source,
    })?;
    let table = widen(&table, chunk)?;

    match &options.columns {
        Some(columns) => Ok(table.project(columns)?),
        None => Ok(table),
    }
}

/// Applies the read-side widening table.
fn widen(table: &Table, chunk: &str) -> Result<Table, DecodeError> {
    let defs = table.column_defs();
    if defs.iter().all(|def| def.ty.widened() == def.ty) {
        return Ok(table.clone());
    }
    let widened: Vec<ColumnDef> = defs
        .into_iter()
        .map(|def| ColumnDef::new(def.name, def.ty.widened()))
        .collect();
    Ok(table.cast_to(&widened, Some(chunk))?)
}

/// Reads the column declarations stored in a Parquet file footer, widened as on decode.
pub fn read_schema(chunk: &str, bytes: Bytes) -> Result<Vec<ColumnDef>, DecodeError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(|source| {
        DecodeError::Parquet {
            chunk: chunk.to_string(),
            source,
        }
    })?;
    let table = Table::try_new(arrow::array::RecordBatch::new_empty(Arc::clone(
        builder.schema(),
    )))
    .map_err(|source| DecodeError::Table {
        chunk: chunk.to_string(),
        source,
    })?;
    Ok(table
        .column_defs()
        .into_iter()
        .map(|def| ColumnDef::new(def.name, def.ty.widened()))
        .collect())
}
