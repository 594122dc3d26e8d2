//! Write-mode coordination.
//!
//! A write job partitions the table, clears whatever the write mode replaces, encodes and
//! stores every chunk through the executor, then registers the result in the catalog. The job
//! only reports success once every object is stored and the catalog is in sync.
//!
//! A job that fails after some objects were stored leaves them in place; the error lists them
//! so callers can clean them up.

use std::collections::BTreeMap;

use lakeshift_catalog::{
    CatalogPartition, CatalogSnapshot, CatalogSynchronizer, Registration, SyncError, TableRef,
    check_layout, conform, describe,
};
use lakeshift_codec::{CsvCompression, FileFormat};
use lakeshift_executor::{BoxError, Executor, ServiceError, TaskFailure};
use lakeshift_object_store::{InvalidPathError, StorageUrl};
use lakeshift_table::{
    ChunkTarget, PartitionChunk, PartitionError, PartitionValues, Partitioner,
    SchemaMismatchError, Table,
};
use monitoring::logging;
use object_store::path::Path;

use crate::{
    WriterConfig,
    job::{Job, JobState, TransitionError},
    keys::{KeyPlanner, RunId},
};

/// Table parameter holding the field delimiter of delimited text tables.
pub const FIELD_DELIMITER: &str = "field.delim";
/// Table parameter holding the number of header lines of delimited text tables.
pub const HEADER_LINE_COUNT: &str = "skip.header.line.count";
/// Table parameter holding the compression of a table's objects.
pub const COMPRESSION_TYPE: &str = "compressionType";

/// How a write treats data already stored at the target location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteMode {
    /// Delete everything under the base location, then write. The catalog entry is replaced.
    Overwrite,
    /// Add new objects next to the existing ones.
    #[default]
    Append,
    /// Replace only the partitions the write produces. Other partitions are left untouched.
    OverwritePartitions,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteMode::Overwrite => "overwrite",
            WriteMode::Append => "append",
            WriteMode::OverwritePartitions => "overwrite_partitions",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for WriteMode {
    type Err = UnknownWriteModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(WriteMode::Overwrite),
            "append" => Ok(WriteMode::Append),
            "overwrite_partitions" | "overwrite-partitions" => Ok(WriteMode::OverwritePartitions),
            _ => Err(UnknownWriteModeError(s.to_string())),
        }
    }
}

/// The write mode string is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("unknown write mode '{0}', expected one of: overwrite, append, overwrite_partitions")]
pub struct UnknownWriteModeError(String);

/// Options of one write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub mode: WriteMode,
    pub format: FileFormat,
    /// Columns whose values become `col=value` path segments, in path order.
    pub partition_columns: Vec<String>,
    pub chunk_target: ChunkTarget,
    /// Write a single object with this name instead of generated chunk names. Cannot be combined
    /// with partition columns.
    pub file_name: Option<String>,
    /// Catalog table to validate against and register. Requires a catalog.
    pub table: Option<TableRef>,
    /// Extra catalog table parameters.
    pub parameters: BTreeMap<String, String>,
}

impl WriteOptions {
    /// Options with the configured format and chunk target.
    pub fn from_config(config: &WriterConfig, mode: WriteMode) -> Self {
        Self {
            mode,
            format: config.format,
            chunk_target: config.chunk_target,
            ..Default::default()
        }
    }
}

/// Outcome of a committed write.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub run_id: RunId,
    pub state: JobState,
    /// URLs of the stored objects.
    pub objects: Vec<String>,
    /// URLs of the written partition prefixes, in first-seen order.
    pub partitions: Vec<String>,
    pub rows: usize,
}

#[derive(Debug, Clone)]
struct WriteTask {
    key: Path,
    chunk: PartitionChunk,
}

/// Writes tables as datasets of objects under a base location.
///
/// All objects are stored through the executor's client, so locations must lie in the bucket
/// (or filesystem) the client addresses.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    executor: Executor,
    catalog: Option<CatalogSynchronizer>,
}

impl DatasetWriter {
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

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn catalog(&self) -> Option<&CatalogSynchronizer> {
        self.catalog.as_ref()
    }

    /// Writes `table` under `location`.
    pub async fn write(
        &self,
        table: &Table,
        location: &str,
        options: &WriteOptions,
    ) -> Result<WriteReport, WriteError> {
        let mut job = Job::new(RunId::new());
        self.write_job(&mut job, table, location, options).await
    }

    /// Writes `table` under `location` as `job`, which must be in the planned state.
    ///
    /// On failure the job is left [`Failed`](JobState::Failed).
    #[tracing::instrument(skip_all, fields(location = %location, mode = %options.mode), err)]
    pub async fn write_job(
        &self,
        job: &mut Job,
        table: &Table,
        location: &str,
        options: &WriteOptions,
    ) -> Result<WriteReport, WriteError> {
        if job.state() != JobState::Planned {
            return Err(TransitionError {
                run_id: job.run_id(),
                from: job.state(),
                to: JobState::Staged,
            }
            .into());
        }
        match self.run(job, table, location, options).await {
            Ok(report) => Ok(report),
            Err(err) => {
                job.fail()?;
                tracing::warn!(
                    run_id = %job.run_id(),
                    error = %err, error_source = logging::error_source(&err),
                    "write job failed"
                );
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        job: &mut Job,
        table: &Table,
        location: &str,
        options: &WriteOptions,
    ) -> Result<WriteReport, WriteError> {
        if options.file_name.is_some() && !options.partition_columns.is_empty() {
            return Err(WriteError::InvalidOptions(
                "a pinned file name cannot be combined with partition columns",
            ));
        }
        let mut planner = KeyPlanner::new(location, job.run_id(), options.format.extension())?;
        if let Some(file_name) = &options.file_name {
            planner = planner.with_file_name(file_name.clone());
        }

        // Catalog pre-read. A failure fails the job before anything is deleted or written.
        let snapshot = match (&self.catalog, &options.table) {
            (Some(sync), Some(name)) => sync.fetch(name).await.map_err(WriteError::CatalogRead)?,
            (None, Some(_)) => {
                return Err(WriteError::InvalidOptions(
                    "a catalog table was given but no catalog is configured",
                ));
            }
            _ => None,
        };

        let data = match &snapshot {
            Some(snapshot) if options.mode != WriteMode::Overwrite => {
                check_layout(&snapshot.table, planner.base().as_str(), &options.partition_columns)
                    .map_err(|err| WriteError::CatalogRead(err.into()))?;
                conform(&snapshot.table, table)?
            }
            _ => table.clone(),
        };

        let target = if options.file_name.is_some() {
            ChunkTarget::Files(1)
        } else {
            options.chunk_target
        };
        let partitions =
            Partitioner::new(options.partition_columns.clone(), target).partition(&data)?;
        let written_partitions = partitions.pending_values();
        let tasks = partitions
            .map(|chunk| {
                let chunk = chunk?;
                let key = planner.key(&chunk.values, chunk.chunk_index)?;
                Ok(WriteTask { key, chunk })
            })
            .collect::<Result<Vec<_>, WriteError>>()?;

        tracing::debug!(
            run_id = %job.run_id(),
            partitions = written_partitions.len(),
            objects = tasks.len(),
            "planned write"
        );

        self.clear(&planner, options.mode, snapshot.as_ref(), &written_partitions)
            .await?;

        let objects = self.stage(&planner, options.format, tasks).await?;
        job.advance(JobState::Staged)?;

        let partition_urls = written_partitions
            .iter()
            .map(|values| planner.partition_url(values))
            .collect::<Result<Vec<_>, _>>()?;

        if let (Some(sync), Some(name)) = (&self.catalog, &options.table) {
            let registration = self
                .registration(name, &data, &planner, options, &written_partitions, &partition_urls)
                .map_err(|source| WriteError::CatalogSync {
                    orphaned: objects.clone(),
                    source: source.into(),
                })?;
            sync.register(registration)
                .await
                .map_err(|source| WriteError::CatalogSync {
                    orphaned: objects.clone(),
                    source,
                })?;
        }
        job.advance(JobState::CatalogSynced)?;
        job.advance(JobState::Committed)?;

        tracing::info!(
            run_id = %job.run_id(),
            objects = objects.len(),
            partitions = partition_urls.len(),
            rows = data.num_rows(),
            "write committed"
        );
        Ok(WriteReport {
            run_id: job.run_id(),
            state: job.state(),
            objects,
            partitions: partition_urls,
            rows: data.num_rows(),
        })
    }

    /// Deletes the objects the write mode replaces.
    async fn clear(
        &self,
        planner: &KeyPlanner,
        mode: WriteMode,
        snapshot: Option<&CatalogSnapshot>,
        written: &[PartitionValues],
    ) -> Result<(), WriteError> {
        let prefixes = match mode {
            WriteMode::Append => return Ok(()),
            WriteMode::Overwrite => vec![planner.base_path().clone()],
            WriteMode::OverwritePartitions => {
                let mut prefixes = written
                    .iter()
                    .map(|values| planner.partition_path(values))
                    .collect::<Result<Vec<_>, _>>()?;
                // Registered partitions may live outside the default layout
                if let Some(snapshot) = snapshot {
                    for values in written {
                        let catalog_values = CatalogPartition::from_values(values, "").values;
                        if let Some(registered) = snapshot
                            .partitions
                            .iter()
                            .find(|p| p.values == catalog_values)
                        {
                            let path = StorageUrl::new(&registered.location)?.object_path()?;
                            if !prefixes.contains(&path) {
                                prefixes.push(path);
                            }
                        }
                    }
                }
                prefixes
            }
        };

        let mut locations = Vec::new();
        for prefix in &prefixes {
            let listed = self
                .executor
                .list(prefix)
                .await
                .map_err(|source| WriteError::Cleanup {
                    failed: vec![prefix.to_string()],
                    source,
                })?;
            locations.extend(listed.into_iter().map(|meta| meta.location));
        }
        if locations.is_empty() {
            return Ok(());
        }

        tracing::debug!(%mode, objects = locations.len(), "deleting replaced objects");
        let outcome = self.executor.delete_all(locations).await;
        let failed: Vec<String> = outcome
            .failed
            .iter()
            .map(|failure| failure.task.to_string())
            .chain(outcome.cancelled.iter().map(Path::to_string))
            .collect();
        match outcome.into_result() {
            Ok(_) => Ok(()),
            Err(source) => Err(WriteError::Cleanup { failed, source }),
        }
    }

    /// Encodes and stores every chunk. Returns the URLs of the stored objects.
    async fn stage(
        &self,
        planner: &KeyPlanner,
        format: FileFormat,
        tasks: Vec<WriteTask>,
    ) -> Result<Vec<String>, WriteError> {
        let outcome = self
            .executor
            .run_batch(
                tasks,
                |task| format!("write '{}'", task.key),
                |task| async move {
                    let WriteTask { key, chunk } = task;
                    let payload = self
                        .executor
                        .spawn_blocking("encode chunk", move || {
                            format.encode(&chunk.table).map_err(BoxError::from)
                        })
                        .await?;
                    self.executor
                        .client()
                        .put(&key, payload, Some(format.content_type()))
                        .await
                        .map(|_| ())
                        .map_err(|err| ServiceError::from_store(format!("put '{key}'"), err))
                },
            )
            .await;

        let mut written: Vec<String> = outcome
            .succeeded
            .iter()
            .map(|(task, _)| planner.url_of(&task.key).to_string())
            .collect();
        written.sort();
        if outcome.failed.is_empty() && outcome.cancelled.is_empty() {
            return Ok(written);
        }
        Err(PartialWriteError {
            run_id: planner.run_id(),
            written,
            failed: outcome
                .failed
                .into_iter()
                .map(|TaskFailure { task, error }| ObjectFailure {
                    key: planner.url_of(&task.key).to_string(),
                    error,
                })
                .collect(),
            cancelled: outcome
                .cancelled
                .iter()
                .map(|task| planner.url_of(&task.key).to_string())
                .collect(),
        }
        .into())
    }

    fn registration(
        &self,
        name: &TableRef,
        data: &Table,
        planner: &KeyPlanner,
        options: &WriteOptions,
        written: &[PartitionValues],
        partition_urls: &[String],
    ) -> Result<Registration, SchemaMismatchError> {
        let mut parameters = options.parameters.clone();
        if let FileFormat::Csv(csv) = &options.format {
            parameters.insert(
                FIELD_DELIMITER.to_string(),
                char::from(csv.delimiter).to_string(),
            );
            parameters.insert(
                HEADER_LINE_COUNT.to_string(),
                if csv.header { "1" } else { "0" }.to_string(),
            );
            if csv.compression == CsvCompression::Gzip {
                parameters.insert(COMPRESSION_TYPE.to_string(), "gzip".to_string());
            }
        }
        let table = describe(
            name.clone(),
            data,
            &options.partition_columns,
            planner.base().as_str(),
            options.format.classification(),
            parameters,
        )?;
        let partitions = if options.partition_columns.is_empty() {
            Vec::new()
        } else {
            written
                .iter()
                .zip(partition_urls)
                .map(|(values, url)| CatalogPartition::from_values(values, url.clone()))
                .collect()
        };
        Ok(Registration {
            table,
            partitions,
            replace: options.mode == WriteMode::Overwrite,
        })
    }
}

/// One object that could not be stored.
#[derive(Debug)]
pub struct ObjectFailure {
    pub key: String,
    pub error: ServiceError,
}

/// Some objects of a write job could not be stored.
///
/// The objects that were stored stay in place and are listed in [`written`](Self::written).
#[derive(Debug, thiserror::Error)]
#[error(
    "write job {run_id} stored {} objects, {} failed, {} were not attempted",
    .written.len(), .failed.len(), .cancelled.len()
)]
pub struct PartialWriteError {
    pub run_id: RunId,
    /// URLs of the objects that were stored.
    pub written: Vec<String>,
    pub failed: Vec<ObjectFailure>,
    /// URLs of objects that were never attempted because the job was cancelled.
    pub cancelled: Vec<String>,
}

/// Errors raised by [`DatasetWriter::write`].
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The target location is not a valid storage URI.
    #[error(transparent)]
    InvalidPath(#[from] InvalidPathError),

    /// The write options contradict each other.
    #[error("invalid write options: {0}")]
    InvalidOptions(&'static str),

    /// The table could not be partitioned.
    #[error("failed to partition table")]
    Partition(#[from] PartitionError),

    /// The data does not match the declared catalog schema.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),

    /// The catalog could not be read, or the entry contradicts the write.
    ///
    /// Nothing was deleted or written.
    #[error("catalog check failed")]
    CatalogRead(#[source] SyncError),

    /// Objects replaced by the write could not be deleted. Nothing was written.
    #[error("failed to delete {} replaced objects", .failed.len())]
    Cleanup {
        failed: Vec<String>,
        #[source]
        source: ServiceError,
    },

    /// Some objects could not be stored.
    #[error(transparent)]
    PartialWrite(#[from] PartialWriteError),

    /// Every object was stored but the catalog registration failed.
    #[error("failed to register write in catalog, {} objects were orphaned", .orphaned.len())]
    CatalogSync {
        /// URLs of the stored objects the catalog does not reference.
        orphaned: Vec<String>,
        #[source]
        source: SyncError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl WriteError {
    /// URLs of the objects stored by the failed job.
    pub fn orphaned_objects(&self) -> &[String] {
        match self {
            WriteError::PartialWrite(err) => &err.written,
            WriteError::CatalogSync { orphaned, .. } => orphaned,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_parses_both_spellings() {
        assert_eq!(
            "overwrite-partitions".parse::<WriteMode>().expect("Failed to parse mode"),
            WriteMode::OverwritePartitions
        );
        assert_eq!(
            "Overwrite".parse::<WriteMode>().expect("Failed to parse mode"),
            WriteMode::Overwrite
        );
        assert!("upsert".parse::<WriteMode>().is_err());
        assert_eq!(WriteMode::OverwritePartitions.to_string(), "overwrite_partitions");
    }
}
