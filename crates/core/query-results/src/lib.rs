//! Query-result materialization.
//!
//! Runs SQL on the managed query service and turns the result into [`Table`]s, either by paging
//! through the service's result rows ([`QueryMaterializer::run_direct`]) or by having the service
//! unload the result as Parquet into object storage and reading it back in parallel
//! ([`QueryMaterializer::run_staged`]).
//!
//! Direct mode keeps at most one page in memory but reads sequentially and only sees the text
//! rendering of values. Staged mode reads with full type fidelity and parallelism at the cost of
//! extra storage and of waiting for the unloaded objects to become visible.

use std::{sync::Arc, time::Duration};

use lakeshift_codec::ReadFormat;
use lakeshift_dataset::{DatasetReader, ReadError, ReadOptions};
use lakeshift_executor::{Executor, PollError, PollPolicy, RetryPolicy, ServiceError};
use lakeshift_object_store::{InvalidPathError, StorageUrl};
use lakeshift_table::{SchemaMismatchError, Table, TableError, UnsupportedTypeError};
use monitoring::logging;
use uuid::Uuid;

mod pages;
mod service;

pub use self::{
    pages::{MAX_PAGE_SIZE, ResultPages, column_defs},
    service::{QueryId, QueryService, QueryState, ResultColumn, ResultPage},
};

/// Query settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Minimum delay between query state checks.
    pub poll_min_interval: Duration,
    /// Maximum delay between query state checks.
    pub poll_max_interval: Duration,
    /// Give up waiting for a query after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Rows per result page in direct mode.
    pub page_size: usize,
    pub workgroup: Option<String>,
    /// Location under which the service writes raw results and staged unloads.
    pub staging_location: Option<String>,
    /// Keep staged objects after they were read.
    pub keep_staged: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            poll_min_interval: Duration::from_millis(250),
            poll_max_interval: Duration::from_secs(5),
            timeout: None,
            page_size: MAX_PAGE_SIZE,
            workgroup: None,
            staging_location: None,
            keep_staged: true,
        }
    }
}

impl QueryConfig {
    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            min_interval: self.poll_min_interval,
            max_interval: self.poll_max_interval,
            timeout: self.timeout,
        }
    }
}

/// Renders the statement that unloads the result of `sql` as Parquet under `location`.
pub fn unload_statement(sql: &str, location: &str) -> String {
    let sql = sql.trim().trim_end_matches(';');
    let location = location.replace('\'', "''");
    format!("UNLOAD ({sql}) TO '{location}' WITH (format = 'PARQUET')")
}

/// Runs queries and materializes their results.
#[derive(Debug, Clone)]
pub struct QueryMaterializer {
    service: Arc<dyn QueryService>,
    executor: Executor,
    reader: DatasetReader,
    config: QueryConfig,
}

impl QueryMaterializer {
    /// `executor` reads staged results and must address the bucket of the staging location.
    pub fn new(service: Arc<dyn QueryService>, executor: Executor, config: QueryConfig) -> Self {
        let reader = DatasetReader::new(executor.clone());
        Self {
            service,
            executor,
            reader,
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    fn retry(&self) -> &RetryPolicy {
        self.executor.retry_policy()
    }

    /// Submits `sql`. Submission is not retried, since a retried submission may run twice.
    async fn start(&self, sql: &str) -> Result<QueryId, QueryError> {
        let id = self
            .service
            .start_query(
                sql,
                self.config.staging_location.as_deref(),
                self.config.workgroup.as_deref(),
            )
            .await
            .map_err(QueryError::Submit)?;
        tracing::debug!(query_id = %id, "query submitted");
        Ok(id)
    }

    /// Waits until the query reaches a terminal state and fails unless it succeeded.
    #[tracing::instrument(skip_all, fields(query_id = %id), err)]
    pub async fn wait(&self, id: &QueryId) -> Result<(), QueryError> {
        let context = format!("state of query {id}");
        let state = self
            .config
            .poll_policy()
            .poll(&context, self.retry(), || async {
                let state = self.service.get_query_state(id).await?;
                Ok::<_, ServiceError>(state.is_terminal().then_some(state))
            })
            .await
            .map_err(|source| QueryError::Poll {
                id: id.clone(),
                source,
            })?;

        match state {
            QueryState::Succeeded => Ok(()),
            QueryState::Failed(reason) => Err(QueryError::Failed {
                id: id.clone(),
                reason,
            }),
            QueryState::Cancelled => Err(QueryError::Cancelled { id: id.clone() }),
            QueryState::Queued | QueryState::Running => Err(QueryError::Poll {
                id: id.clone(),
                source: PollError::Service(ServiceError::permanent_message(
                    "query reported a non-terminal state as finished",
                )),
            }),
        }
    }

    /// Runs `sql` and returns its result rows as pages of [`QueryConfig::page_size`] rows.
    #[tracing::instrument(skip_all, err)]
    pub async fn run_direct(&self, sql: &str) -> Result<ResultPages, QueryError> {
        let id = self.start(sql).await?;
        self.wait(&id).await?;
        ResultPages::new(
            self.service.clone(),
            id,
            self.config.page_size,
            self.retry().clone(),
        )
    }

    /// Runs `sql` through an unload to a fresh location under the staging location and reads
    /// the unloaded objects back.
    pub async fn run_staged(&self, sql: &str) -> Result<Table, QueryError> {
        let staging = self
            .config
            .staging_location
            .as_deref()
            .ok_or(QueryError::NoStagingLocation)?;
        let location = format!("{}{}/", StorageUrl::new(staging)?.as_prefix(), Uuid::now_v7());
        self.run_staged_at(sql, &location).await
    }

    /// Runs `sql` through an unload to `location` and reads the unloaded objects back.
    ///
    /// `location` must be empty. A result without rows may produce no objects at all; it is
    /// read as an empty table with the result's columns.
    #[tracing::instrument(skip_all, fields(location = %location), err)]
    pub async fn run_staged_at(&self, sql: &str, location: &str) -> Result<Table, QueryError> {
        let id = self.start(&unload_statement(sql, location)).await?;
        self.wait(&id).await?;

        let options = ReadOptions {
            format: Some(ReadFormat::Parquet),
            ..Default::default()
        };
        let table = match self.reader.read(location, &options).await {
            Ok(table) => table,
            Err(ReadError::NoObjects { .. }) => {
                tracing::debug!(query_id = %id, "unload produced no objects");
                let mut pages =
                    ResultPages::new(self.service.clone(), id.clone(), 1, self.retry().clone())?;
                if let Some(page) = pages.next_page().await {
                    page?;
                }
                Table::empty(pages.columns().unwrap_or_default())
            }
            Err(source) => return Err(QueryError::Read(source)),
        };

        if !self.config.keep_staged {
            self.remove_staged(location).await;
        }
        tracing::info!(query_id = %id, rows = table.num_rows(), "staged query result read");
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

/// Errors raised while running a query or materializing its result.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The query could not be submitted.
    #[error("failed to submit query")]
    Submit(#[source] ServiceError),

    /// Waiting for the query failed or timed out.
    #[error("failed to wait for query {id}")]
    Poll {
        id: QueryId,
        #[source]
        source: PollError,
    },

    /// The query failed on the service. `reason` is the service's message.
    #[error("query {id} failed: {reason}")]
    Failed { id: QueryId, reason: String },

    /// The query was cancelled on the service.
    #[error("query {id} was cancelled")]
    Cancelled { id: QueryId },

    /// Result rows could not be fetched.
    #[error("failed to fetch results of query {id}")]
    Results {
        id: QueryId,
        #[source]
        source: ServiceError,
    },

    /// The page size is outside `1..=MAX_PAGE_SIZE`.
    #[error("page size {0} is outside 1..={MAX_PAGE_SIZE}")]
    InvalidPageSize(usize),

    /// A result column has a type outside the supported set.
    #[error("result column '{column}' has an unsupported type")]
    UnsupportedType {
        column: String,
        #[source]
        source: UnsupportedTypeError,
    },

    /// A result row does not have one value per column.
    #[error("row of {page} has {actual} values, expected {expected}")]
    RowWidth {
        page: String,
        expected: usize,
        actual: usize,
    },

    /// A result value does not fit its column type.
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),

    #[error("failed to assemble result page")]
    Table(#[from] TableError),

    /// Staged mode was requested without a staging location.
    #[error("no staging location is configured")]
    NoStagingLocation,

    #[error(transparent)]
    InvalidPath(#[from] InvalidPathError),

    /// The staged result could not be read.
    #[error("failed to read staged result")]
    Read(#[source] ReadError),
}
