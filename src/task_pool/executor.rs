use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::task::Task;
use crate::errors::{SqsWorkerError, TaskError};

/// Runs tasks of one type with a decoded payload.
///
/// ```rust
/// use async_trait::async_trait;
/// use serde::Deserialize;
/// use rs_sqs_worker::errors::TaskError;
/// use rs_sqs_worker::task_pool::Executor;
///
/// #[derive(Deserialize)]
/// struct Welcome {
///     email: String,
/// }
///
/// struct WelcomeMailer;
///
/// #[async_trait]
/// impl Executor for WelcomeMailer {
///     type Payload = Welcome;
///
///     async fn execute(&self, payload: Welcome) -> Result<(), TaskError> {
///         if payload.email.is_empty() {
///             return Err(TaskError::SkipRetry("no recipient".into()));
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    /// A [`TaskError::SkipRetry`] fails the task for good; any other error is
    /// retried while the task has retries left.
    async fn execute(&self, payload: Self::Payload) -> Result<(), TaskError>;
}

/// Decodes the task payload and hands it to `executor`.
///
/// A payload that does not decode is a poison payload and yields
/// [`TaskError::SkipRetry`], so it is never retried.
pub async fn process_task<E: Executor>(task: &Task, executor: &E) -> Result<(), TaskError> {
    let payload: E::Payload = serde_json::from_slice(&task.payload).map_err(|e| {
        TaskError::SkipRetry(format!("cannot decode payload of task {}: {e}", task.id))
    })?;
    executor.execute(payload).await
}

/// Type-erased executor stored in the registry.
#[async_trait]
pub trait DynExecutor: Send + Sync {
    async fn execute_task(&self, task: &Task) -> Result<(), TaskError>;
}

struct TypedExecutor<E> {
    inner: E,
}

#[async_trait]
impl<E: Executor> DynExecutor for TypedExecutor<E> {
    async fn execute_task(&self, task: &Task) -> Result<(), TaskError> {
        process_task(task, &self.inner).await
    }
}

/// Executors keyed by task type.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn DynExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `task_type`; each type takes one executor.
    pub fn register<E: Executor>(
        &mut self,
        task_type: impl Into<String>,
        executor: E,
    ) -> Result<(), SqsWorkerError> {
        let task_type = task_type.into();
        if self.executors.contains_key(&task_type) {
            return Err(SqsWorkerError::DuplicateExecutor(task_type));
        }
        self.executors
            .insert(task_type, Arc::new(TypedExecutor { inner: executor }));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynExecutor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &self.registered_types())
            .finish()
    }
}
