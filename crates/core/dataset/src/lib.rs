//! Datasets of objects in storage.
//!
//! A dataset is a set of Parquet or delimited text objects under a base location, optionally
//! partitioned into Hive-style `col=value/` prefixes and registered in a catalog.
//! [`DatasetWriter`] writes tables as datasets in one of the [`WriteMode`]s;
//! [`DatasetReader`] reads them back.

use lakeshift_codec::FileFormat;
use lakeshift_table::ChunkTarget;

pub mod job;
pub mod keys;
mod reader;
mod writer;

pub use self::{
    job::{Job, JobState, TransitionError},
    keys::{KeyPlanner, RunId},
    reader::{DatasetObject, DatasetReader, ReadError, ReadOptions},
    writer::{
        COMPRESSION_TYPE, DatasetWriter, FIELD_DELIMITER, HEADER_LINE_COUNT, ObjectFailure,
        PartialWriteError, UnknownWriteModeError, WriteError, WriteMode, WriteOptions,
        WriteReport,
    },
};

/// Defaults applied to writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterConfig {
    pub chunk_target: ChunkTarget,
    pub format: FileFormat,
}
