//! # Tasks
//!
//! $$
//! \texttt{NOT\_FOUND} \to \texttt{IN\_PROGRESS} \to \{\texttt{SUCCESS}, \texttt{FAILURE}\}
//! $$
//!
//! Asynchronous optimisation runs. A submitted request gets an id, an empty
//! progress log and a slot in a bounded queue; a worker pool drains the queue
//! and writes exactly one terminal outcome per task.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::OptimizationRequest;
use crate::quant::portfolio::Portfolio;

pub mod pool;
pub mod store;

pub use pool::TaskOrchestrator;
pub use pool::WorkerPoolConfig;
pub use store::TaskLog;
pub use store::TaskOutcome;
pub use store::TaskStore;

/// Lifecycle of a task as seen by a poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
  NotFound,
  InProgress,
  Success,
  Failure,
}

impl TaskState {
  /// Whether the task has a stored outcome.
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Success | TaskState::Failure)
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskState::NotFound => write!(f, "NOT_FOUND"),
      TaskState::InProgress => write!(f, "IN_PROGRESS"),
      TaskState::Success => write!(f, "SUCCESS"),
      TaskState::Failure => write!(f, "FAILURE"),
    }
  }
}

/// Work executed for one task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
  async fn run(&self, request: OptimizationRequest, log: TaskLog) -> Result<Portfolio>;
}
