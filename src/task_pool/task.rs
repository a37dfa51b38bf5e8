use std::fmt;
use std::time::Duration;

/// A unit of work for the task pool.
///
/// Built by [`TaskPoolProcessor::new_task`](crate::task_pool::TaskPoolProcessor::new_task),
/// which encodes the payload as JSON and bakes in the pool's retry and timeout
/// defaults. The fields are public so callers can override either per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    /// Selects the executor.
    pub task_type: String,
    pub payload: Vec<u8>,
    /// Retries after the first attempt.
    pub max_retry: u32,
    /// Upper bound for one attempt.
    pub timeout: Duration,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        payload: Vec<u8>,
        max_retry: u32,
        timeout: Duration,
    ) -> Self {
        Task {
            id: id.into(),
            task_type: task_type.into(),
            payload,
            max_retry,
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Enqueued, possibly delayed or waiting for a retry.
    Waiting,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "task:waiting",
            TaskStatus::Running => "task:running",
            TaskStatus::Completed => "task:completed",
            TaskStatus::Failed => "task:failed",
        }
    }

    /// Completed and failed tasks never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    /// Retries performed so far.
    pub retried: u32,
    pub max_retry: u32,
    pub last_error: Option<String>,
}

impl TaskInfo {
    pub(crate) fn waiting(task: &Task) -> Self {
        TaskInfo {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
            status: TaskStatus::Waiting,
            retried: 0,
            max_retry: task.max_retry,
            last_error: None,
        }
    }
}
