//! Managed query service protocol.

use lakeshift_executor::ServiceError;

/// Identifier the query service assigns to a started query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution state of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    /// The query failed; the service's reason is kept verbatim.
    Failed(String),
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Succeeded | QueryState::Failed(_) | QueryState::Cancelled
        )
    }
}

/// Name and catalog type name of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumn {
    pub name: String,
    pub type_name: String,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// One page of query results.
///
/// Values are the service's text rendering of each cell; `None` is SQL `NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultPage {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Token of the next page, `None` on the last page.
    pub next_token: Option<String>,
}

/// The narrow protocol spoken to the managed SQL query service.
///
/// Errors carry their transient/permanent classification; the caller decides which calls are
/// retried.
#[async_trait::async_trait]
pub trait QueryService: Send + Sync + std::fmt::Debug {
    /// Submits `sql` for execution. Raw results are written under `output_location`.
    async fn start_query(
        &self,
        sql: &str,
        output_location: Option<&str>,
        workgroup: Option<&str>,
    ) -> Result<QueryId, ServiceError>;

    async fn get_query_state(&self, id: &QueryId) -> Result<QueryState, ServiceError>;

    /// Fetches up to `max_results` rows, resuming after `token` if given.
    async fn get_query_results(
        &self,
        id: &QueryId,
        token: Option<&str>,
        max_results: usize,
    ) -> Result<ResultPage, ServiceError>;
}
