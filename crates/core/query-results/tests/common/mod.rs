//! In-memory query service for query-result tests

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use lakeshift_dataset::{DatasetWriter, WriteMode, WriteOptions};
use lakeshift_executor::{Executor, ExecutorConfig, RetryPolicy, ServiceError};
use lakeshift_object_store::ObjectStoreClient;
use lakeshift_query_results::{
    QueryConfig, QueryId, QueryService, QueryState, ResultColumn, ResultPage,
};
use lakeshift_table::{ChunkTarget, Table};
use object_store::memory::InMemory;
use parking_lot::Mutex;

pub const STAGING: &str = "s3://bucket/staging";

/// How a registered statement ends.
#[derive(Debug, Clone)]
pub enum Outcome {
    Rows(Table),
    Fail(String),
    Cancel,
}

#[derive(Debug)]
struct Query {
    outcome: Outcome,
    /// Rows served through the result API. Unloads serve none.
    served: Option<Table>,
    checks: usize,
}

/// Query service answering registered statements from in-memory tables.
///
/// Unloads write the registered table as Parquet through a [`DatasetWriter`] on the shared
/// store.
#[derive(Debug)]
pub struct FakeQueryService {
    writer: DatasetWriter,
    statements: BTreeMap<String, Outcome>,
    queries: Mutex<BTreeMap<QueryId, Query>>,
    next_id: AtomicUsize,
    /// Number of state checks answered with a non-terminal state.
    pub pending_checks: usize,
    pub submitted: Mutex<Vec<String>>,
    pub result_calls: AtomicUsize,
}

impl FakeQueryService {
    pub fn new(executor: Executor) -> Self {
        Self {
            writer: DatasetWriter::new(executor),
            statements: BTreeMap::new(),
            queries: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
            pending_checks: 2,
            submitted: Mutex::new(Vec::new()),
            result_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_statement(mut self, sql: &str, outcome: Outcome) -> Self {
        self.statements.insert(sql.to_string(), outcome);
        self
    }

    pub fn with_pending_checks(mut self, checks: usize) -> Self {
        self.pending_checks = checks;
        self
    }

    fn parse_unload(sql: &str) -> Option<(&str, String)> {
        let rest = sql.strip_prefix("UNLOAD (")?;
        let (inner, rest) = rest.rsplit_once(") TO '")?;
        let (location, _) = rest.split_once("' WITH")?;
        Some((inner, location.replace("''", "'")))
    }
}

#[async_trait::async_trait]
impl QueryService for FakeQueryService {
    async fn start_query(
        &self,
        sql: &str,
        _output_location: Option<&str>,
        _workgroup: Option<&str>,
    ) -> Result<QueryId, ServiceError> {
        self.submitted.lock().push(sql.to_string());
        let unload = Self::parse_unload(sql);
        let statement = unload.as_ref().map_or(sql, |(inner, _)| inner);
        let outcome = self.statements.get(statement).cloned().ok_or_else(|| {
            ServiceError::transient("start query", "ThrottlingException: Rate exceeded")
        })?;

        let served = match (&outcome, &unload) {
            (Outcome::Rows(table), Some((_, location))) => {
                if table.num_rows() > 0 {
                    let options = WriteOptions {
                        mode: WriteMode::Append,
                        chunk_target: ChunkTarget::Rows(40_000),
                        ..Default::default()
                    };
                    self.writer
                        .write(table, location, &options)
                        .await
                        .map_err(|err| ServiceError::permanent("unload", err))?;
                }
                Some(Table::empty(&table.column_defs()))
            }
            (Outcome::Rows(table), None) => Some(table.clone()),
            _ => None,
        };

        let id = QueryId::new(format!("q-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.queries.lock().insert(
            id.clone(),
            Query {
                outcome,
                served,
                checks: 0,
            },
        );
        Ok(id)
    }

    async fn get_query_state(&self, id: &QueryId) -> Result<QueryState, ServiceError> {
        let mut queries = self.queries.lock();
        let query = queries
            .get_mut(id)
            .ok_or_else(|| ServiceError::permanent_message(format!("unknown query {id}")))?;
        query.checks += 1;
        if query.checks == 1 && self.pending_checks > 0 {
            return Ok(QueryState::Queued);
        }
        if query.checks <= self.pending_checks {
            return Ok(QueryState::Running);
        }
        Ok(match &query.outcome {
            Outcome::Rows(_) => QueryState::Succeeded,
            Outcome::Fail(reason) => QueryState::Failed(reason.clone()),
            Outcome::Cancel => QueryState::Cancelled,
        })
    }

    async fn get_query_results(
        &self,
        id: &QueryId,
        token: Option<&str>,
        max_results: usize,
    ) -> Result<ResultPage, ServiceError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        let queries = self.queries.lock();
        let table = queries
            .get(id)
            .and_then(|query| query.served.as_ref())
            .ok_or_else(|| ServiceError::permanent_message(format!("no results for {id}")))?;

        let offset = token.map_or(Ok(0), str::parse::<usize>).map_err(|err| {
            ServiceError::permanent("invalid token", err)
        })?;
        let end = (offset + max_results).min(table.num_rows());
        let rows = table
            .slice(offset, end - offset)
            .rows()
            .map(|row| row.iter().map(|value| value.to_text()).collect())
            .collect();
        Ok(ResultPage {
            columns: table
                .column_defs()
                .into_iter()
                .map(|def| ResultColumn::new(def.name, def.ty.catalog_name()))
                .collect(),
            rows,
            next_token: (end < table.num_rows()).then(|| end.to_string()),
        })
    }
}

pub fn executor(client: Arc<ObjectStoreClient>) -> Executor {
    Executor::new(
        client,
        ExecutorConfig {
            concurrency: 8,
            retry: RetryPolicy {
                max_attempts: 3,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                call_timeout: Duration::from_secs(30),
            },
        },
    )
}

pub fn store() -> Arc<ObjectStoreClient> {
    Arc::new(ObjectStoreClient::new(Arc::new(InMemory::new())))
}

pub fn config() -> QueryConfig {
    QueryConfig {
        poll_min_interval: Duration::from_millis(1),
        poll_max_interval: Duration::from_millis(5),
        staging_location: Some(STAGING.to_string()),
        ..Default::default()
    }
}
