use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{OperatorError, RetryPolicy};

pub type BoxOperator = Arc<dyn Operator>;

/// A unit of pipeline work.
///
/// Implementations must be idempotent: the scheduler re-invokes `execute`
/// with the same context after a failed attempt, and the end state after
/// any number of successful invocations must match a single one.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Short operator kind used in logs, e.g. `"stage"`.
    fn kind(&self) -> &'static str;

    async fn execute(&self, ctx: &OperatorContext) -> Result<(), OperatorError>;
}

/// Per-attempt execution context handed to an operator.
#[derive(Debug, Clone)]
pub struct OperatorContext {
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub credentials: Credentials,
    pub cancel: CancellationToken,
}

/// Opaque credential context for the object store and warehouse.
///
/// Obtained once per run. The `Debug` impl never prints the secret.
#[derive(Clone, Default)]
pub struct Credentials {
    inner: Arc<CredentialsInner>,
}

#[derive(Default)]
struct CredentialsInner {
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(CredentialsInner {
                access_key_id: access_key_id.into(),
                secret_access_key: secret_access_key.into(),
                region: region.into(),
            }),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.inner.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.inner.secret_access_key
    }

    pub fn region(&self) -> &str {
        &self.inner.region
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("region", &self.inner.region)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One schedulable unit: an operator plus its identity, dependency edges
/// and retry policy.
#[derive(Clone)]
pub struct TaskNode {
    id: String,
    operator: BoxOperator,
    dependencies: BTreeSet<String>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    pub(crate) state: TaskState,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, operator: BoxOperator) -> Self {
        Self {
            id: id.into(),
            operator,
            dependencies: BTreeSet::new(),
            retry_policy: None,
            timeout: None,
            state: TaskState::Pending,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Per-attempt timeout. Falls back to the scheduler default when unset.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operator(&self) -> &BoxOperator {
        &self.operator
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn state(&self) -> TaskState {
        self.state
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("operator", &self.operator.kind())
            .field("dependencies", &self.dependencies)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish()
    }
}
