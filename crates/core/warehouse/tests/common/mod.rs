//! In-memory warehouse for bulk transfer tests

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use arrow::array::{ArrayRef, Int64Array, StringArray};
use lakeshift_codec::ReadFormat;
use lakeshift_dataset::{DatasetReader, DatasetWriter, ReadError, ReadOptions, WriteOptions};
use lakeshift_executor::{Executor, ExecutorConfig, RetryPolicy, ServiceError};
use lakeshift_object_store::ObjectStoreClient;
use lakeshift_table::Table;
use lakeshift_warehouse::{
    StatementId, StatementState, WarehouseConfig, WarehouseService, statements::SCRIPT_SEPARATOR,
};
use object_store::memory::InMemory;
use parking_lot::Mutex;

pub const STAGING: &str = "s3://bucket/staging";
pub const IAM_ROLE: &str = "arn:aws:iam::123456789012:role/warehouse-load";

#[derive(Debug)]
struct Statement {
    outcome: StatementState,
    checks: usize,
}

/// Warehouse keeping only the row count of each table.
///
/// `COPY` counts the rows of the objects under its prefix by reading them as Parquet through a
/// [`DatasetReader`] on the shared store. `UNLOAD` writes the registered result of its query
/// through a [`DatasetWriter`]. Each submitted script runs against a copy of the tables that is
/// only kept when every statement succeeds. A finished script reports the rows it copied or
/// inserted.
#[derive(Debug)]
pub struct FakeWarehouse {
    reader: DatasetReader,
    writer: DatasetWriter,
    results: BTreeMap<String, Table>,
    failures: Vec<(String, String)>,
    abort_marker: Option<String>,
    pub tables: Mutex<BTreeMap<String, u64>>,
    pub submitted: Mutex<Vec<String>>,
    statements: Mutex<BTreeMap<StatementId, Statement>>,
    next_id: AtomicUsize,
}

impl FakeWarehouse {
    pub fn new(executor: Executor) -> Self {
        Self {
            reader: DatasetReader::new(executor.clone()),
            writer: DatasetWriter::new(executor),
            results: BTreeMap::new(),
            failures: Vec::new(),
            abort_marker: None,
            tables: Mutex::new(BTreeMap::new()),
            submitted: Mutex::new(Vec::new()),
            statements: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Serves `table` as the result of `sql` in unloads.
    pub fn with_result(mut self, sql: &str, table: Table) -> Self {
        self.results.insert(sql.to_string(), table);
        self
    }

    /// Fails every script containing `marker` with `reason`.
    pub fn failing_on(mut self, marker: &str, reason: &str) -> Self {
        self.failures.push((marker.to_string(), reason.to_string()));
        self
    }

    /// Aborts every script containing `marker`.
    pub fn aborting_on(mut self, marker: &str) -> Self {
        self.abort_marker = Some(marker.to_string());
        self
    }

    pub fn rows_of(&self, table: &str) -> Option<u64> {
        self.tables.lock().get(table).copied()
    }

    async fn run_script(&self, script: &str) -> StatementState {
        if let Some((_, reason)) = self
            .failures
            .iter()
            .find(|(marker, _)| script.contains(marker))
        {
            return StatementState::Failed(reason.clone());
        }
        if self
            .abort_marker
            .as_ref()
            .is_some_and(|marker| script.contains(marker.as_str()))
        {
            return StatementState::Aborted;
        }

        let mut tables = self.tables.lock().clone();
        let mut affected = 0;
        for statement in script.split(SCRIPT_SEPARATOR) {
            match self.run(statement, &mut tables).await {
                Ok(rows) => affected += rows,
                Err(reason) => return StatementState::Failed(reason),
            }
        }
        *self.tables.lock() = tables;
        StatementState::Finished(affected)
    }

    async fn run(
        &self,
        statement: &str,
        tables: &mut BTreeMap<String, u64>,
    ) -> Result<u64, String> {
        if statement == "BEGIN TRANSACTION" || statement == "END TRANSACTION" {
            return Ok(0);
        }
        if let Some(rest) = statement.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            tables.entry(name_before(rest, " (")).or_insert(0);
            return Ok(0);
        }
        if let Some(rest) = statement.strip_prefix("CREATE TABLE ") {
            let (name, like) = rest
                .split_once(" (LIKE ")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            let like = like.trim_end_matches(')');
            if !tables.contains_key(like) {
                return Err(format!("relation {like} does not exist"));
            }
            tables.insert(name.to_string(), 0);
            return Ok(0);
        }
        if let Some(name) = statement.strip_prefix("DROP TABLE IF EXISTS ") {
            tables.remove(name);
            return Ok(0);
        }
        if let Some(rest) = statement.strip_prefix("DELETE FROM ") {
            if !rest.contains(" USING ") {
                *existing(tables, rest)? = 0;
            }
            return Ok(0);
        }
        if let Some(rest) = statement.strip_prefix("COPY ") {
            let (target, rest) = rest
                .split_once(" FROM '")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            let (prefix, format) = rest
                .split_once("' IAM_ROLE ")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            if !format.ends_with("FORMAT AS PARQUET") {
                return Err("only parquet copies are supported".to_string());
            }
            let target = name_before(target, " (");
            existing(tables, &target)?;
            let rows = self.count_rows(prefix).await?;
            *existing(tables, &target)? += rows;
            return Ok(rows);
        }
        if let Some(rest) = statement.strip_prefix("INSERT INTO ") {
            let (target, rest) = rest
                .split_once(" SELECT ")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            let (_, source) = rest
                .split_once(" FROM ")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            let rows = *existing(tables, &name_before(source, " "))?;
            *existing(tables, target)? += rows;
            return Ok(rows);
        }
        if let Some(rest) = statement.strip_prefix("UNLOAD ('") {
            let (sql, rest) = rest
                .split_once("') TO '")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            let (location, _) = rest
                .split_once("' IAM_ROLE ")
                .ok_or_else(|| format!("syntax error: {statement}"))?;
            let sql = sql.replace("''", "'");
            let table = self
                .results
                .get(&sql)
                .ok_or_else(|| format!("no result registered for {sql}"))?;
            if table.num_rows() > 0 {
                self.writer
                    .write(table, location, &WriteOptions::default())
                    .await
                    .map_err(|err| err.to_string())?;
            }
            return Ok(table.num_rows() as u64);
        }
        Err(format!("syntax error: {statement}"))
    }

    async fn count_rows(&self, prefix: &str) -> Result<u64, String> {
        let options = ReadOptions {
            format: Some(ReadFormat::Parquet),
            ..Default::default()
        };
        match self.reader.read(prefix, &options).await {
            Ok(table) => Ok(table.num_rows() as u64),
            Err(ReadError::NoObjects { .. }) => Ok(0),
            Err(err) => Err(err.to_string()),
        }
    }
}

fn name_before(rest: &str, delimiter: &str) -> String {
    rest.split_once(delimiter)
        .map_or(rest, |(name, _)| name)
        .to_string()
}

fn existing<'a>(tables: &'a mut BTreeMap<String, u64>, name: &str) -> Result<&'a mut u64, String> {
    tables
        .get_mut(name)
        .ok_or_else(|| format!("relation {name} does not exist"))
}

#[async_trait::async_trait]
impl WarehouseService for FakeWarehouse {
    async fn execute_statement(&self, sql: &str) -> Result<StatementId, ServiceError> {
        self.submitted.lock().push(sql.to_string());
        let outcome = self.run_script(sql).await;
        let id = StatementId::new(format!("s-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.statements
            .lock()
            .insert(id.clone(), Statement { outcome, checks: 0 });
        Ok(id)
    }

    async fn describe_statement(&self, id: &StatementId) -> Result<StatementState, ServiceError> {
        let mut statements = self.statements.lock();
        let statement = statements
            .get_mut(id)
            .ok_or_else(|| ServiceError::permanent_message(format!("unknown statement {id}")))?;
        statement.checks += 1;
        Ok(match statement.checks {
            1 => StatementState::Submitted,
            2 => StatementState::Running,
            _ => statement.outcome.clone(),
        })
    }
}

pub fn store() -> Arc<ObjectStoreClient> {
    Arc::new(ObjectStoreClient::new(Arc::new(InMemory::new())))
}

pub fn executor(client: Arc<ObjectStoreClient>) -> Executor {
    Executor::new(
        client,
        ExecutorConfig {
            concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                call_timeout: Duration::from_secs(10),
            },
        },
    )
}

pub fn config() -> WarehouseConfig {
    WarehouseConfig {
        iam_role: Some(IAM_ROLE.to_string()),
        poll_min_interval: Duration::from_millis(1),
        poll_max_interval: Duration::from_millis(5),
        staging_location: Some(STAGING.to_string()),
        ..Default::default()
    }
}

/// 10 rows, 3 columns, 2 distinct regions.
pub fn sales() -> Table {
    Table::from_columns([
        (
            "id",
            Arc::new(Int64Array::from_iter_values(0..10)) as ArrayRef,
        ),
        (
            "item",
            Arc::new(StringArray::from_iter_values((0..10).map(|i| format!("item-{i}"))))
                as ArrayRef,
        ),
        (
            "region",
            Arc::new(StringArray::from(vec![
                "eu", "us", "eu", "eu", "us", "us", "eu", "us", "eu", "eu",
            ])) as ArrayRef,
        ),
    ])
    .expect("Failed to build table")
}
