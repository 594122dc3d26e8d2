//! Warehouse statement protocol.

use lakeshift_executor::ServiceError;

/// Identifier the warehouse assigns to a submitted statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(String);

impl StatementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StatementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution state of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementState {
    Submitted,
    Running,
    /// The statement completed, affecting this many rows.
    Finished(u64),
    /// The statement failed; the warehouse's reason is kept verbatim.
    Failed(String),
    Aborted,
}

impl StatementState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatementState::Finished(_) | StatementState::Failed(_) | StatementState::Aborted
        )
    }
}

/// The narrow protocol spoken to a managed relational warehouse.
///
/// A statement may be a script of several statements separated by `;` and a newline; the
/// warehouse runs it as one unit and reports the total rows affected.
#[async_trait::async_trait]
pub trait WarehouseService: Send + Sync + std::fmt::Debug {
    async fn execute_statement(&self, sql: &str) -> Result<StatementId, ServiceError>;

    async fn describe_statement(&self, id: &StatementId) -> Result<StatementState, ServiceError>;
}
