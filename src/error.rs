use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Error raised by user code inside a task, shared between every dependent
/// that observes it.
#[derive(Debug, Clone)]
pub struct TaskError(pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The error returned by the wrapped function.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = &**self.0;
        inner.source()
    }
}

#[derive(Debug, Error, Clone)]
pub enum ExecError {
    #[error("No execution client is configured, call `set_client` first")]
    Lifecycle,

    #[error("An execution client is already running, call `close` before configuring a new one")]
    AlreadyInitialized,

    #[error("Cycle detected in task graph at task '{node}'")]
    GraphCycle { node: String },

    #[error("Task '{node}' was declared but never defined")]
    UndefinedNode { node: String },

    #[error("Task '{node}' is already defined")]
    AlreadyDefined { node: String },

    #[error("Handle does not belong to this execution context")]
    ForeignNode,

    #[error("Argument '{node}' has no computed result")]
    UnresolvedDependency { node: String },

    #[error("Task '{node}' could not run because a dependency failed:\n{cause}")]
    UpstreamFailure { node: String, cause: Box<ExecError> },

    #[error("Task '{node}':\n{source}")]
    WorkerExecution { node: String, source: TaskError },

    #[error("Expected output of type {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("Computation was cancelled")]
    Cancelled,

    #[error("Failed to build worker pool: {0}")]
    PoolBuild(String),

    #[error("Compute thread failed: {0}")]
    Spawn(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ExecError {
    /// Returns the error that started a failure chain. For anything other
    /// than [`ExecError::UpstreamFailure`] this is the error itself.
    pub fn root_cause(&self) -> &ExecError {
        match self {
            ExecError::UpstreamFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Wraps `cause` as the failure observed by `node`, keeping the chain
    /// flat so that every dependent points at the same original error.
    pub(crate) fn upstream(node: impl Into<String>, cause: &ExecError) -> Self {
        ExecError::UpstreamFailure {
            node: node.into(),
            cause: Box::new(cause.root_cause().clone()),
        }
    }

    pub(crate) fn worker(node: impl Into<String>, err: anyhow::Error) -> Self {
        ExecError::WorkerExecution {
            node: node.into(),
            source: TaskError::from(err),
        }
    }
}

impl From<rayon::ThreadPoolBuildError> for ExecError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        ExecError::PoolBuild(e.to_string())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(e: serde_json::Error) -> Self {
        ExecError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_keeps_root_cause() {
        let root = ExecError::worker("a", anyhow::anyhow!("boom"));
        let first = ExecError::upstream("b", &root);
        let second = ExecError::upstream("c", &first);

        match second.root_cause() {
            ExecError::WorkerExecution { node, source } => {
                assert_eq!(node, "a");
                assert_eq!(source.inner().to_string(), "boom");
            }
            other => panic!("unexpected root cause {other:?}"),
        }

        match &second {
            ExecError::UpstreamFailure { cause, .. } => {
                assert!(matches!(**cause, ExecError::WorkerExecution { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_task_error_is_shared() {
        let err = TaskError::new(anyhow::anyhow!("shared"));
        let copy = err.clone();
        assert!(Arc::ptr_eq(&err.0, &copy.0));
    }
}
