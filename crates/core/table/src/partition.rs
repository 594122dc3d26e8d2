//! Hive-style partitioning and chunking of tables.
//!
//! A [`Partitioner`] groups the rows of a [`Table`] by the values of its partition columns and
//! splits every group into chunks no larger than a [`ChunkTarget`]. Each group maps to a
//! `col1=v1/col2=v2/` storage prefix.

use std::{collections::HashMap, vec};

use arrow::{
    array::{ArrayRef, UInt32Array},
    compute::take_record_batch,
    error::ArrowError,
    row::{OwnedRow, RowConverter, SortField},
};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::{ColumnType, Table, Value};

/// Path segment value standing in for a null partition value.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Characters escaped in partition path segments.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'\'')
    .add(b'*')
    .add(b'/')
    .add(b':')
    .add(b'=')
    .add(b'?')
    .add(b'\\')
    .add(b'{')
    .add(b'[')
    .add(b']')
    .add(b'^');

/// Escapes a column name or value for use in a partition path segment.
pub fn escape_path_segment(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_ESCAPE).to_string()
}

/// Reverses [`escape_path_segment`].
pub fn unescape_path_segment(escaped: &str) -> String {
    percent_decode_str(escaped).decode_utf8_lossy().into_owned()
}

/// Parses one `col=value` path segment.
///
/// Returns `None` if the segment is not a partition segment. The sentinel
/// [`HIVE_DEFAULT_PARTITION`] decodes to a `None` value.
pub fn parse_partition_segment(segment: &str) -> Option<(String, Option<String>)> {
    let (column, value) = segment.split_once('=')?;
    if column.is_empty() {
        return None;
    }
    let column = unescape_path_segment(column);
    if value == HIVE_DEFAULT_PARTITION {
        return Some((column, None));
    }
    Some((column, Some(unescape_path_segment(value))))
}

/// Upper bound on the size of each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTarget {
    /// At most `n` rows per chunk.
    Rows(usize),
    /// Roughly at most `n` bytes of in-memory data per chunk.
    Bytes(usize),
    /// Split each partition evenly into `n` chunks (fewer if it has fewer rows).
    Files(usize),
}

impl ChunkTarget {
    fn rows_per_chunk(&self, table: &Table) -> usize {
        let rows = table.num_rows();
        match *self {
            ChunkTarget::Rows(n) => n.max(1),
            ChunkTarget::Bytes(n) => {
                let bytes_per_row = table.memory_size().div_ceil(rows.max(1)).max(1);
                (n / bytes_per_row).max(1)
            }
            ChunkTarget::Files(n) => rows.div_ceil(n.max(1)).max(1),
        }
    }
}

impl Default for ChunkTarget {
    fn default() -> Self {
        ChunkTarget::Rows(1_000_000)
    }
}

/// Partition column values of one group, in partition column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionValues(Vec<(String, Value)>);

impl PartitionValues {
    pub fn new(values: Vec<(String, Value)>) -> Self {
        Self(values)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// The text form of every value, with `None` for nulls.
    pub fn texts(&self) -> Vec<Option<String>> {
        self.0.iter().map(|(_, value)| value.to_text()).collect()
    }

    /// Escaped `col=value` path segments, in partition column order.
    pub fn path_segments(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(name, value)| {
                let value = value
                    .to_text()
                    .map(|text| escape_path_segment(&text))
                    .unwrap_or_else(|| HIVE_DEFAULT_PARTITION.to_string());
                format!("{}={}", escape_path_segment(name), value)
            })
            .collect()
    }

    /// The relative prefix of this partition, e.g. `region=eu/year=2020/`.
    ///
    /// Empty for the synthetic partition of an unpartitioned write.
    pub fn prefix(&self) -> String {
        self.path_segments()
            .into_iter()
            .map(|segment| segment + "/")
            .collect()
    }
}

/// One chunk of one partition.
#[derive(Debug, Clone)]
pub struct PartitionChunk {
    pub values: PartitionValues,
    /// Position of the chunk within its partition, starting at zero.
    pub chunk_index: usize,
    /// The chunk rows, without the partition columns.
    pub table: Table,
}

/// Groups table rows by partition column values and splits each group into chunks.
#[derive(Debug, Clone)]
pub struct Partitioner {
    columns: Vec<String>,
    target: ChunkTarget,
}

impl Partitioner {
    pub fn new(columns: Vec<String>, target: ChunkTarget) -> Self {
        Self { columns, target }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Splits `table` into chunks.
    ///
    /// Rows are grouped in a single pass; sub-tables and chunks are materialized lazily as the
    /// returned iterator advances. Partitions are yielded in first-seen order. With no partition
    /// columns a single synthetic partition holds every row, and at least one chunk is yielded
    /// even for an empty table. With partition columns an empty table yields nothing.
    pub fn partition(&self, table: &Table) -> Result<Partitions, PartitionError> {
        for column in &self.columns {
            match table.column_type(column) {
                None => {
                    return Err(PartitionError::MissingColumn {
                        column: column.clone(),
                    });
                }
                Some(ColumnType::Binary) => {
                    return Err(PartitionError::BinaryColumn {
                        column: column.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        if matches!(
            self.target,
            ChunkTarget::Rows(0) | ChunkTarget::Bytes(0) | ChunkTarget::Files(0)
        ) {
            return Err(PartitionError::ZeroChunkTarget);
        }

        let groups = if self.columns.is_empty() {
            // The synthetic partition reuses the whole table
            vec![Group {
                first_row: 0,
                rows: Vec::new(),
            }]
        } else {
            group_rows(table, &self.columns)?
        };

        Ok(Partitions {
            table: table.clone(),
            columns: self.columns.clone(),
            target: self.target,
            groups: groups.into_iter(),
            current: None,
        })
    }
}

struct Group {
    first_row: usize,
    rows: Vec<u32>,
}

fn group_rows(table: &Table, columns: &[String]) -> Result<Vec<Group>, PartitionError> {
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .filter_map(|column| table.column(column).cloned())
        .collect();
    let fields = arrays
        .iter()
        .map(|array| SortField::new(array.data_type().clone()))
        .collect();
    let converter = RowConverter::new(fields).map_err(PartitionError::Grouping)?;
    let rows = converter
        .convert_columns(&arrays)
        .map_err(PartitionError::Grouping)?;

    let mut index: HashMap<OwnedRow, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for (row_idx, row) in rows.iter().enumerate() {
        let group_idx = *index.entry(row.owned()).or_insert_with(|| {
            groups.push(Group {
                first_row: row_idx,
                rows: Vec::new(),
            });
            groups.len() - 1
        });
        groups[group_idx].rows.push(row_index(row_idx)?);
    }
    Ok(groups)
}

/// Row indices are gathered with `u32` offsets.
fn row_index(row: usize) -> Result<u32, PartitionError> {
    u32::try_from(row).map_err(|_| PartitionError::TooManyRows { row })
}

/// Lazy sequence of partition chunks produced by [`Partitioner::partition`].
pub struct Partitions {
    table: Table,
    columns: Vec<String>,
    target: ChunkTarget,
    groups: vec::IntoIter<Group>,
    current: Option<CurrentPartition>,
}

struct CurrentPartition {
    values: PartitionValues,
    table: Table,
    rows_per_chunk: usize,
    next_chunk: usize,
}

impl Partitions {
    /// Values of the partitions not yet opened, in emission order.
    ///
    /// Called before iterating, this lists every partition the table will be written to.
    pub fn pending_values(&self) -> Vec<PartitionValues> {
        self.groups
            .as_slice()
            .iter()
            .map(|group| self.values_of(group.first_row))
            .collect()
    }

    fn values_of(&self, row: usize) -> PartitionValues {
        PartitionValues(
            self.columns
                .iter()
                .filter_map(|column| {
                    let idx = self.table.index_of(column)?;
                    Some((column.clone(), self.table.value(row, idx)))
                })
                .collect(),
        )
    }

    fn open(&self, group: Group) -> Result<CurrentPartition, PartitionError> {
        let values = self.values_of(group.first_row);

        let sub_table = if self.columns.is_empty() {
            self.table.clone()
        } else {
            let indices = UInt32Array::from(group.rows);
            let batch = take_record_batch(self.table.as_record_batch(), &indices)
                .map_err(PartitionError::Grouping)?;
            Table::try_new(batch)
                .map_err(PartitionError::SubTable)?
                .drop_columns(&self.columns)
        };

        Ok(CurrentPartition {
            values,
            rows_per_chunk: self.target.rows_per_chunk(&sub_table),
            table: sub_table,
            next_chunk: 0,
        })
    }
}

impl Iterator for Partitions {
    type Item = Result<PartitionChunk, PartitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = &mut self.current {
                let offset = current.next_chunk * current.rows_per_chunk;
                let total = current.table.num_rows();
                // An empty partition still yields its first chunk
                if offset < total || (offset == 0 && current.next_chunk == 0) {
                    let length = current.rows_per_chunk.min(total - offset);
                    let chunk = PartitionChunk {
                        values: current.values.clone(),
                        chunk_index: current.next_chunk,
                        table: current.table.slice(offset, length),
                    };
                    current.next_chunk += 1;
                    return Some(Ok(chunk));
                }
                self.current = None;
            }

            let group = self.groups.next()?;
            match self.open(group) {
                Ok(current) => self.current = Some(current),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Errors raised while partitioning a table.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// A partition column does not exist in the table.
    #[error("partition column '{column}' does not exist")]
    MissingColumn { column: String },

    /// Binary values have no path-safe text form.
    #[error("binary column '{column}' cannot be used as a partition column")]
    BinaryColumn { column: String },

    /// The table has more rows than a partition can index.
    #[error("row {row} exceeds the partitionable row count of {}", u32::MAX)]
    TooManyRows { row: usize },

    /// The chunk target would produce empty chunks.
    #[error("chunk target must be greater than zero")]
    ZeroChunkTarget,

    /// Row grouping failed inside Arrow.
    #[error("failed to group rows by partition values")]
    Grouping(#[source] ArrowError),

    #[error("failed to build partition sub-table")]
    SubTable(#[source] crate::TableError),
}
