//! Bulk transfers between datasets and a managed relational warehouse.
//!
//! Loads stage a table as objects under a staging location through the
//! [`DatasetWriter`] and then have the warehouse `COPY` them in with one statement. Unloads have
//! the warehouse `UNLOAD` a query result as Parquet and read it back through the
//! [`DatasetReader`]. Every statement is submitted once and then polled until it finishes.

use std::{sync::Arc, time::Duration};

use lakeshift_codec::{FileFormat, ReadFormat};
use lakeshift_dataset::{
    DatasetReader, DatasetWriter, ReadError, ReadOptions, WriteError, WriteMode, WriteOptions,
};
use lakeshift_executor::{Executor, PollError, PollPolicy, ServiceError};
use lakeshift_object_store::{InvalidPathError, StorageUrl};
use lakeshift_table::{ChunkTarget, Table};
use monitoring::logging;
use uuid::Uuid;

mod service;
pub mod statements;

pub use self::{
    service::{StatementId, StatementState, WarehouseService},
    statements::{UpsertMode, WarehouseTable},
};

/// Warehouse settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    /// Role the warehouse assumes to access the staging location.
    pub iam_role: Option<String>,
    pub poll_min_interval: Duration,
    pub poll_max_interval: Duration,
    /// Give up waiting for a statement after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Location under which loads and unloads are staged.
    pub staging_location: Option<String>,
    /// Length of `VARCHAR` columns of created tables.
    pub varchar_length: u32,
    /// Keep staged objects after a successful transfer.
    pub keep_staged: bool,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            iam_role: None,
            poll_min_interval: Duration::from_millis(250),
            poll_max_interval: Duration::from_secs(5),
            timeout: None,
            staging_location: None,
            varchar_length: 256,
            keep_staged: false,
        }
    }
}

impl WarehouseConfig {
    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            min_interval: self.poll_min_interval,
            max_interval: self.poll_max_interval,
            timeout: self.timeout,
        }
    }
}

/// How a load treats rows already in the target table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadMode {
    #[default]
    Append,
    /// Delete every row of the target, then load, in one transaction.
    Overwrite,
    /// Merge on `keys` through a staging table.
    Upsert { keys: Vec<String>, mode: UpsertMode },
}

/// Options of one load.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub mode: LoadMode,
    /// Format of the staged objects.
    pub format: FileFormat,
    pub chunk_target: ChunkTarget,
}

/// Outcome of a load.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub target: WarehouseTable,
    /// Location the table was staged under.
    pub staged_location: String,
    /// URLs of the staged objects. Removed unless staged objects are kept.
    pub staged_objects: Vec<String>,
    /// Rows the warehouse reported for the load statement.
    pub rows_loaded: u64,
}

/// Drives statements and bulk transfers on a warehouse.
#[derive(Debug, Clone)]
pub struct WarehouseDriver {
    service: Arc<dyn WarehouseService>,
    executor: Executor,
    writer: DatasetWriter,
    reader: DatasetReader,
    config: WarehouseConfig,
}

impl WarehouseDriver {
    /// `executor` stages and reads objects and must address the bucket of the staging location.
    pub fn new(
        service: Arc<dyn WarehouseService>,
        executor: Executor,
        config: WarehouseConfig,
    ) -> Self {
        Self {
            service,
            writer: DatasetWriter::new(executor.clone()),
            reader: DatasetReader::new(executor.clone()),
            executor,
            config,
        }
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Runs `sql` and waits for it to finish. Returns the rows the statement affected.
    ///
    /// Submission is not retried, since a retried submission may run twice. State checks are
    /// retried under the executor's retry policy.
    #[tracing::instrument(skip_all, err)]
    pub async fn execute(&self, sql: &str) -> Result<u64, StatementError> {
        let id = self
            .service
            .execute_statement(sql)
            .await
            .map_err(StatementError::Submit)?;
        tracing::debug!(statement_id = %id, "statement submitted");

        let context = format!("state of statement {id}");
        let state = self
            .config
            .poll_policy()
            .poll(&context, self.executor.retry_policy(), || async {
                let state = self.service.describe_statement(&id).await?;
                Ok::<_, ServiceError>(state.is_terminal().then_some(state))
            })
            .await
            .map_err(|source| StatementError::Poll {
                id: id.clone(),
                source,
            })?;

        match state {
            StatementState::Finished(rows) => {
                tracing::debug!(statement_id = %id, rows, "statement finished");
                Ok(rows)
            }
            StatementState::Failed(reason) => Err(StatementError::Failed { id, reason }),
            StatementState::Aborted => Err(StatementError::Aborted { id }),
            StatementState::Submitted | StatementState::Running => Err(StatementError::Poll {
                id,
                source: PollError::Service(ServiceError::permanent_message(
                    "statement reported a non-terminal state as finished",
                )),
            }),
        }
    }

    fn iam_role(&self) -> Result<&str, WarehouseError> {
        self.config
            .iam_role
            .as_deref()
            .ok_or(WarehouseError::NoIamRole)
    }

    /// A fresh location under the staging location.
    fn staging_run_location(&self) -> Result<String, WarehouseError> {
        let staging = self
            .config
            .staging_location
            .as_deref()
            .ok_or(WarehouseError::NoStagingLocation)?;
        Ok(format!("{}{}/", StorageUrl::new(staging)?.as_prefix(), Uuid::now_v7()))
    }

    /// Loads every object under `prefix` into `target` with one `COPY` statement.
    ///
    /// Returns the rows the warehouse loaded.
    #[tracing::instrument(skip_all, fields(target = %target, prefix = %prefix), err)]
    pub async fn copy(
        &self,
        target: &WarehouseTable,
        prefix: &str,
        format: &FileFormat,
    ) -> Result<u64, WarehouseError> {
        let prefix = StorageUrl::new(prefix)?.as_prefix().to_string();
        let statement = statements::copy(target, None, &prefix, format, self.iam_role()?);
        let rows = self.execute(&statement).await?;
        tracing::info!(%target, rows, "copy finished");
        Ok(rows)
    }

    /// Stages `table` and loads it into `target`, creating `target` when it does not exist.
    ///
    /// When the warehouse rejects the load the staged objects are left in place and reported in
    /// [`WarehouseError::Load`].
    #[tracing::instrument(skip_all, fields(target = %target), err)]
    pub async fn load(
        &self,
        table: &Table,
        target: &WarehouseTable,
        options: &LoadOptions,
    ) -> Result<LoadReport, WarehouseError> {
        let iam_role = self.iam_role()?.to_string();
        if let LoadMode::Upsert { keys, .. } = &options.mode {
            if keys.is_empty() {
                return Err(WarehouseError::NoUpsertKeys);
            }
            if let Some(key) = keys.iter().find(|key| table.index_of(key).is_none()) {
                return Err(WarehouseError::UnknownUpsertKey(key.clone()));
            }
        }
        let location = self.staging_run_location()?;

        let write = WriteOptions {
            mode: WriteMode::Overwrite,
            format: options.format,
            chunk_target: options.chunk_target,
            ..Default::default()
        };
        let staged = self
            .writer
            .write(table, &location, &write)
            .await
            .map_err(WarehouseError::Stage)?;
        tracing::debug!(%location, objects = staged.objects.len(), "table staged");

        let columns = table.column_names();
        let create =
            statements::create_table(target, &table.column_defs(), self.config.varchar_length);
        let result = match &options.mode {
            LoadMode::Append => {
                let copy =
                    statements::copy(target, Some(&columns), &location, &options.format, &iam_role);
                self.run_load(&[create, copy]).await
            }
            LoadMode::Overwrite => {
                let copy =
                    statements::copy(target, Some(&columns), &location, &options.format, &iam_role);
                let replace = statements::transaction(vec![
                    format!("DELETE FROM {target}"),
                    copy,
                ]);
                self.run_load(&[create, replace]).await
            }
            LoadMode::Upsert { keys, mode } => {
                let merge_table = target.with_suffix(&format!("_stage_{}", staged.run_id));
                let copy = statements::copy(
                    &merge_table,
                    Some(&columns),
                    &location,
                    &options.format,
                    &iam_role,
                );
                let result = self
                    .run_load(&[
                        create,
                        statements::create_table_like(&merge_table, target),
                        copy,
                        statements::merge(target, &merge_table, keys, *mode),
                    ])
                    .await;
                if result.is_err()
                    && let Err(err) = self.execute(&statements::drop_table(&merge_table)).await
                {
                    tracing::warn!(
                        table = %merge_table,
                        error = %err, error_source = logging::error_source(&err),
                        "failed to drop merge staging table"
                    );
                }
                result
            }
        };

        let rows_loaded = match result {
            Ok(rows) => rows,
            Err(source) => {
                return Err(WarehouseError::Load {
                    staged: staged.objects,
                    source,
                });
            }
        };

        if !self.config.keep_staged {
            self.remove_staged(&location).await;
        }
        tracing::info!(%target, rows = rows_loaded, "load finished");
        Ok(LoadReport {
            target: target.clone(),
            staged_location: location,
            staged_objects: staged.objects,
            rows_loaded,
        })
    }

    /// Runs `statements` in order. Returns the rows affected by the last one.
    async fn run_load(&self, statements: &[String]) -> Result<u64, StatementError> {
        let mut rows = 0;
        for statement in statements {
            rows = self.execute(statement).await?;
        }
        Ok(rows)
    }

    /// Unloads the result of `sql` to a fresh staging location and reads it back.
    ///
    /// A result without rows may produce no objects; it is read as a table without columns.
    #[tracing::instrument(skip_all, err)]
    pub async fn unload(&self, sql: &str) -> Result<Table, WarehouseError> {
        let location = self.staging_run_location()?;
        self.unload_to(sql, &location).await
    }

    /// Unloads the result of `sql` to `location` and reads it back.
    pub async fn unload_to(&self, sql: &str, location: &str) -> Result<Table, WarehouseError> {
        let prefix = StorageUrl::new(location)?.as_prefix().to_string();
        let statement = statements::unload(sql, &prefix, self.iam_role()?);
        self.execute(&statement).await?;

        let options = ReadOptions {
            format: Some(ReadFormat::Parquet),
            ..Default::default()
        };
        let table = match self.reader.read(&prefix, &options).await {
            Ok(table) => table,
            Err(ReadError::NoObjects { .. }) => {
                tracing::debug!(location = %prefix, "unload produced no objects");
                Table::empty(&[])
            }
            Err(source) => return Err(WarehouseError::Read(source)),
        };

        if !self.config.keep_staged {
            self.remove_staged(&prefix).await;
        }
        tracing::info!(location = %prefix, rows = table.num_rows(), "unload read");
        Ok(table)
    }

    async fn remove_staged(&self, location: &str) {
        let prefix = match StorageUrl::new(location).and_then(|url| url.object_path()) {
            Ok(prefix) => prefix,
            Err(err) => {
                tracing::warn!(%location, error = %err, "invalid staged location, not removed");
                return;
            }
        };
        match self.executor.delete_prefix(&prefix).await {
            Ok(outcome) if outcome.is_complete() => {}
            Ok(outcome) => tracing::warn!(
                %location,
                failed = outcome.failed.len(),
                "some staged objects could not be removed"
            ),
            Err(err) => tracing::warn!(
                %location,
                error = %err, error_source = logging::error_source(&err),
                "failed to remove staged objects"
            ),
        }
    }
}

/// Errors raised while running one statement.
#[derive(Debug, thiserror::Error)]
pub enum StatementError {
    /// The statement could not be submitted.
    #[error("failed to submit statement")]
    Submit(#[source] ServiceError),

    /// Waiting for the statement failed or timed out.
    #[error("failed to wait for statement {id}")]
    Poll {
        id: StatementId,
        #[source]
        source: PollError,
    },

    /// The warehouse rejected the statement. `reason` is the warehouse's message.
    #[error("statement {id} failed: {reason}")]
    Failed { id: StatementId, reason: String },

    #[error("statement {id} was aborted")]
    Aborted { id: StatementId },
}

/// Errors raised by bulk transfers.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Statement(#[from] StatementError),

    /// Transfers need a role for the warehouse to access storage.
    #[error("no IAM role is configured")]
    NoIamRole,

    #[error("no staging location is configured")]
    NoStagingLocation,

    #[error("upsert requires at least one key column")]
    NoUpsertKeys,

    #[error("upsert key '{0}' is not a column of the table")]
    UnknownUpsertKey(String),

    #[error(transparent)]
    InvalidPath(#[from] InvalidPathError),

    /// The table could not be staged.
    #[error("failed to stage table")]
    Stage(#[source] WriteError),

    /// The warehouse did not load the staged objects, which were left in place.
    #[error("failed to load {} staged objects", .staged.len())]
    Load {
        /// URLs of the staged objects.
        staged: Vec<String>,
        #[source]
        source: StatementError,
    },

    /// The unloaded result could not be read.
    #[error("failed to read unloaded result")]
    Read(#[source] ReadError),
}

impl WarehouseError {
    /// URLs of staged objects a failed transfer left behind.
    pub fn staged_objects(&self) -> &[String] {
        match self {
            WarehouseError::Load { staged, .. } => staged,
            WarehouseError::Stage(err) => err.orphaned_objects(),
            _ => &[],
        }
    }
}
