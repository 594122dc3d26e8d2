//! Delimited text (CSV) chunk codec.
//!
//! Text carries no types, so decoding needs the column declarations of the file. Every column is
//! read as text first and then converted as a whole; a value that does not convert fails the
//! entire chunk. Empty fields are read as nulls, so empty strings do not survive a round-trip.

use std::{
    io::{Cursor, Read as _, Write as _},
    sync::Arc,
};

use arrow::{
    compute::{concat_batches, filter_record_batch},
    csv::{ReaderBuilder, WriterBuilder, reader::Format},
    datatypes::{DataType, Field, Schema},
};
use bytes::Bytes;
use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use lakeshift_table::{ColumnDef, ColumnType, SchemaMismatchError, Table};
use tracing::trace;

use crate::{CsvCompression, DecodeError, DecodeOptions, EncodeError, compression, filter};

const READ_BATCH_SIZE: usize = 8192;

/// Delimited text layout options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: u8,
    /// Whether the first line holds the column names.
    pub header: bool,
    /// Compression applied on write. Reads detect compression on their own.
    pub compression: CsvCompression,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            header: true,
            compression: CsvCompression::None,
        }
    }
}

/// Encodes a table as delimited text.
pub fn encode(table: &Table, options: &CsvOptions) -> Result<Bytes, EncodeError> {
    if let Some(def) = table
        .column_defs()
        .into_iter()
        .find(|def| def.ty == ColumnType::Binary)
    {
        return Err(EncodeError::UnsupportedCsvColumn { column: def.name });
    }

    let mut buf = Vec::new();
    {
        let mut writer = WriterBuilder::new()
            .with_header(options.header)
            .with_delimiter(options.delimiter)
            .build(&mut buf);
        writer
            .write(table.as_record_batch())
            .map_err(EncodeError::Csv)?;
    }

    let buf = match options.compression {
        CsvCompression::None => buf,
        CsvCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&buf).map_err(EncodeError::Compress)?;
            encoder.finish().map_err(EncodeError::Compress)?
        }
    };
    trace!(rows = table.num_rows(), bytes = buf.len(), "encoded csv chunk");
    Ok(Bytes::from(buf))
}

/// Decodes delimited text into the declared columns.
///
/// `defs` lists every column stored in the file, in file order. Gzip compression is detected
/// from the `.gz` extension of `chunk` or from the payload's magic bytes.
pub fn decode(
    chunk: &str,
    bytes: Bytes,
    defs: &[ColumnDef],
    csv: &CsvOptions,
    options: &DecodeOptions,
) -> Result<Table, DecodeError> {
    let data = if compression::is_gzip(chunk, &bytes) {
        let mut decoded = Vec::new();
        MultiGzDecoder::new(bytes.as_ref())
            .read_to_end(&mut decoded)
            .map_err(|source| DecodeError::Decompress {
                chunk: chunk.to_string(),
                source,
            })?;
        Bytes::from(decoded)
    } else {
        bytes
    };

    if csv.header {
        check_header(chunk, &data, defs, csv.delimiter)?;
    }

    let text_schema = Arc::new(Schema::new(
        defs.iter()
            .map(|def| Field::new(&def.name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let arrow_err = |source| DecodeError::Arrow {
        chunk: chunk.to_string(),
        source,
    };
    let reader = ReaderBuilder::new(text_schema.clone())
        .with_header(csv.header)
        .with_delimiter(csv.delimiter)
        .with_batch_size(READ_BATCH_SIZE)
        .build(Cursor::new(data))
        .map_err(arrow_err)?;
    let batches = reader.collect::<Result<Vec<_>, _>>().map_err(arrow_err)?;
    let batch = concat_batches(&text_schema, &batches).map_err(arrow_err)?;

    let text = Table::try_new(batch).map_err(|source| DecodeError::Table {
        chunk: chunk.to_string(),
        source,
    })?;
    let table = text.cast_to(defs, Some(chunk))?;

    let table = match filter::evaluate_all(&options.filters, table.as_record_batch())
        .map_err(arrow_err)?
    {
        Some(mask) => {
            let filtered =
                filter_record_batch(table.as_record_batch(), &mask).map_err(arrow_err)?;
            Table::try_new(filtered).map_err(|source| DecodeError::Table {
                chunk: chunk.to_string(),
                source,
            })?
        }
        None => table,
    };

    match &options.columns {
        Some(columns) => Ok(table.project(columns)?),
        None => Ok(table),
    }
}

fn check_header(
    chunk: &str,
    data: &[u8],
    defs: &[ColumnDef],
    delimiter: u8,
) -> Result<(), DecodeError> {
    if data.is_empty() {
        return Ok(());
    }
    let (header, _) = Format::default()
        .with_header(true)
        .with_delimiter(delimiter)
        .infer_schema(Cursor::new(data), Some(0))
        .map_err(|source| DecodeError::Arrow {
            chunk: chunk.to_string(),
            source,
        })?;

    for (idx, def) in defs.iter().enumerate() {
        match header.fields().get(idx) {
            Some(field) if field.name() == &def.name => {}
            _ => {
                return Err(SchemaMismatchError::MissingColumn {
                    column: def.name.clone(),
                }
                .into());
            }
        }
    }
    if let Some(extra) = header.fields().get(defs.len()) {
        return Err(SchemaMismatchError::UndeclaredColumn {
            column: extra.name().clone(),
        }
        .into());
    }
    Ok(())
}
