//! Chunk codecs.
//!
//! Transcodes one in-memory [`Table`] chunk to and from one file in object storage, either as
//! Parquet ([`columnar`]) or as delimited text ([`delimited`]).

use arrow::error::ArrowError;
use bytes::Bytes;
use lakeshift_table::{ColumnDef, SchemaMismatchError, Table, TableError};
use parquet::errors::ParquetError;

pub mod columnar;
mod compression;
pub mod delimited;
pub mod filter;

pub use self::{
    compression::{CsvCompression, ParquetCompression, is_gzip},
    delimited::CsvOptions,
    filter::{CompareOp, Predicate},
};

/// On-storage file format of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Parquet(ParquetCompression),
    Csv(CsvOptions),
}

impl Default for FileFormat {
    fn default() -> Self {
        FileFormat::Parquet(ParquetCompression::default())
    }
}

impl FileFormat {
    /// File name extension, e.g. `.snappy.parquet` or `.csv.gz`.
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Parquet(compression) => compression.extension(),
            FileFormat::Csv(options) => options.compression.extension(),
        }
    }

    /// The content type objects of this format are stored with.
    pub fn content_type(&self) -> &'static str {
        match self {
            FileFormat::Parquet(_) => "application/vnd.apache.parquet",
            FileFormat::Csv(CsvOptions {
                compression: CsvCompression::Gzip,
                ..
            }) => "application/gzip",
            FileFormat::Csv(_) => "text/csv",
        }
    }

    /// The catalog classification of this format.
    pub fn classification(&self) -> &'static str {
        match self {
            FileFormat::Parquet(_) => "parquet",
            FileFormat::Csv(_) => "csv",
        }
    }

    /// The kind of this format.
    pub fn kind(&self) -> FormatKind {
        match self {
            FileFormat::Parquet(_) => FormatKind::Parquet,
            FileFormat::Csv(_) => FormatKind::Csv,
        }
    }

    pub fn encode(&self, table: &Table) -> Result<Bytes, EncodeError> {
        match self {
            FileFormat::Parquet(compression) => columnar::encode(table, *compression),
            FileFormat::Csv(options) => delimited::encode(table, options),
        }
    }
}

/// Format family, independent of compression and layout options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Parquet,
    Csv,
}

impl FormatKind {
    /// Detects the format of an object from its key.
    ///
    /// Returns `None` for keys that are neither Parquet nor delimited text files.
    pub fn detect(key: &str) -> Option<Self> {
        if key.ends_with(".parquet") {
            Some(FormatKind::Parquet)
        } else if key.ends_with(".csv") || key.ends_with(".csv.gz") {
            Some(FormatKind::Csv)
        } else {
            None
        }
    }
}

/// Read-side options shared by every format.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Columns to decode, in output order. `None` decodes every column.
    pub columns: Option<Vec<String>>,
    /// Conjunction of row predicates.
    pub filters: Vec<Predicate>,
}

/// How to read a file of some format.
#[derive(Debug, Clone)]
pub enum ReadFormat {
    Parquet,
    /// Delimited text with its column declarations.
    Csv {
        schema: Vec<ColumnDef>,
        options: CsvOptions,
    },
}

impl ReadFormat {
    pub fn kind(&self) -> FormatKind {
        match self {
            ReadFormat::Parquet => FormatKind::Parquet,
            ReadFormat::Csv { .. } => FormatKind::Csv,
        }
    }

    /// Decodes one file. `chunk` identifies the file in error reports.
    pub fn decode(
        &self,
        chunk: &str,
        bytes: Bytes,
        options: &DecodeOptions,
    ) -> Result<Table, DecodeError> {
        match self {
            ReadFormat::Parquet => columnar::decode(chunk, bytes, options),
            ReadFormat::Csv {
                schema,
                options: csv,
            } => delimited::decode(chunk, bytes, schema, csv, options),
        }
    }
}

/// Errors raised while encoding a chunk.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The Parquet writer failed.
    #[error("failed to encode parquet chunk")]
    Parquet(#[source] ParquetError),

    /// The CSV writer failed.
    #[error("failed to encode csv chunk")]
    Csv(#[source] ArrowError),

    /// Compressing the encoded text failed.
    #[error("failed to compress chunk")]
    Compress(#[source] std::io::Error),

    /// Delimited text cannot hold binary values.
    #[error("column '{column}' is binary and cannot be written as csv")]
    UnsupportedCsvColumn { column: String },
}

/// Errors raised while decoding a chunk. Every variant names the chunk.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The Parquet file is malformed or could not be read.
    #[error("failed to read parquet chunk '{chunk}'")]
    Parquet {
        chunk: String,
        #[source]
        source: ParquetError,
    },

    /// Arrow failed while decoding, filtering or assembling the chunk.
    #[error("failed to decode chunk '{chunk}'")]
    Arrow {
        chunk: String,
        #[source]
        source: ArrowError,
    },

    /// The chunk could not be decompressed.
    #[error("failed to decompress chunk '{chunk}'")]
    Decompress {
        chunk: String,
        #[source]
        source: std::io::Error,
    },

    /// A projected or filtered column does not exist in the chunk.
    #[error("column '{column}' does not exist in chunk '{chunk}'")]
    UnknownColumn { chunk: String, column: String },

    /// The decoded data does not form a valid table.
    #[error("chunk '{chunk}' holds an invalid table")]
    Table {
        chunk: String,
        #[source]
        source: TableError,
    },

    /// The chunk does not match the declared schema.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_kind_detects_from_extension() {
        assert_eq!(
            FormatKind::detect("t/part-00000-x.snappy.parquet"),
            Some(FormatKind::Parquet)
        );
        assert_eq!(
            FormatKind::detect("t/part-00000-x.csv.gz"),
            Some(FormatKind::Csv)
        );
        assert_eq!(FormatKind::detect("t/_SUCCESS"), None);
    }

    #[test]
    fn content_type_follows_format() {
        assert_eq!(
            FileFormat::Csv(CsvOptions::default()).content_type(),
            "text/csv"
        );
        assert_eq!(
            FileFormat::Parquet(ParquetCompression::Snappy).extension(),
            ".snappy.parquet"
        );
    }
}
