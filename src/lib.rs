pub mod config;
pub mod cycle_check;
pub mod executor;
pub mod graph;
pub mod object_store;
pub mod operators;
pub mod retry;
pub mod sql;
pub mod state_store;
pub mod task;
pub mod warehouse;

pub use config::{ConfigError, SchedulerConfig};
pub use cycle_check::find_cycle;
pub use executor::{NodeOutcome, RunPhase, RunResult, RunStatus, Scheduler};
pub use graph::{StateSnapshot, TaskGraph};
pub use object_store::{MemoryObjectStore, ObjectLocation, ObjectStore};
pub use operators::{
    DataQualityGate, ExtractOperator, LoadOperator, NoopOperator, QualityCheck, StageOperator,
    TableDescriptor, TableSource,
};
pub use retry::{RetryExecutor, RetryPolicy};
pub use sql::{FormatOptions, Identifier, SelectStatement, SqlValue, Statement, TableDefinition};
pub use state_store::{MemoryStateStore, NodeRecord, RunStateStore, StateStoreError};
pub use task::{BoxOperator, Credentials, Operator, OperatorContext, TaskNode, TaskState};
pub use warehouse::{MemoryWarehouse, Row, Warehouse};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or validating a [`TaskGraph`].
///
/// All of these are fatal: a run that hits one aborts before any operator executes.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphError {
    #[error("duplicate task id: {0}")]
    DuplicateId(String),
    #[error("task {node} depends on unknown task {dependency}")]
    UnknownDependency { node: String, dependency: String },
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("object store I/O error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("warehouse connection error: {0}")]
    Connection(String),
    #[error("warehouse statement error: {0}")]
    Statement(String),
}

/// Failure of a single operator attempt.
///
/// Every variant except [`OperatorError::DataQuality`] and
/// [`OperatorError::Cancelled`] is transient and consumes a retry attempt.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorError {
    #[error("object not found: s3://{bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object store I/O error: {0}")]
    ObjectStoreIo(String),
    #[error("warehouse connection error: {0}")]
    WarehouseConnection(String),
    #[error("warehouse statement error: {0}")]
    WarehouseStatement(String),
    #[error("data quality check '{check}' failed on table {table}: measured {}", display_measured(.measured))]
    DataQuality {
        table: String,
        measured: Option<i64>,
        check: String,
    },
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("operator panicked: {0}")]
    Panicked(String),
}

fn display_measured(measured: &Option<i64>) -> String {
    measured.map_or_else(|| "none".to_string(), |v| v.to_string())
}

impl OperatorError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::DataQuality { .. } | Self::Cancelled)
    }

    /// Short, stable name of the error kind, used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ObjectNotFound { .. } => "ObjectNotFoundError",
            Self::ObjectStoreIo(_) => "ObjectStoreIOError",
            Self::WarehouseConnection(_) => "WarehouseConnectionError",
            Self::WarehouseStatement(_) => "WarehouseStatementError",
            Self::DataQuality { .. } => "DataQualityError",
            Self::InvalidStatement(_) => "InvalidStatementError",
            Self::Transform(_) => "TransformError",
            Self::Timeout(_) => "TimeoutError",
            Self::Cancelled => "CancelledError",
            Self::Panicked(_) => "PanicError",
        }
    }
}

impl From<ObjectStoreError> for OperatorError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound { bucket, key } => Self::ObjectNotFound { bucket, key },
            ObjectStoreError::Io(msg) => Self::ObjectStoreIo(msg),
        }
    }
}

impl From<WarehouseError> for OperatorError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::Connection(msg) => Self::WarehouseConnection(msg),
            WarehouseError::Statement(msg) => Self::WarehouseStatement(msg),
        }
    }
}

impl From<sql::SqlError> for OperatorError {
    fn from(err: sql::SqlError) -> Self {
        Self::InvalidStatement(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn data_quality_is_terminal() {
        let err = OperatorError::DataQuality {
            table: "stage_flag".into(),
            measured: Some(0),
            check: "row count > 0".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("stage_flag"));
        assert!(err.to_string().contains("measured 0"));
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(OperatorError::WarehouseConnection("reset".into()).is_retryable());
        assert!(OperatorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OperatorError::Cancelled.is_retryable());
    }

    #[test]
    fn collaborator_errors_convert() {
        let err: OperatorError = ObjectStoreError::NotFound {
            bucket: "b".into(),
            key: "k".into(),
        }
        .into();
        assert_eq!(err.kind(), "ObjectNotFoundError");

        let err: OperatorError = WarehouseError::Statement("syntax".into()).into();
        assert_eq!(err, OperatorError::WarehouseStatement("syntax".into()));
    }

    #[test]
    fn cycle_error_names_path() {
        let err = GraphError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }
}
