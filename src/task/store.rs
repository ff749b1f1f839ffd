//! Task records keyed by id: progress log plus a write-once outcome.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::TaskState;
use crate::error::Error;
use crate::error::Result;
use crate::quant::portfolio::Portfolio;

/// Terminal artifact of a task.
#[derive(Clone, Debug)]
pub enum TaskOutcome {
  Success(Arc<Portfolio>),
  /// Sanitized, user-visible message.
  Failure(String),
}

#[derive(Debug, Default)]
struct TaskRecord {
  log: Vec<String>,
  outcome: Option<TaskOutcome>,
  completed_at: Option<DateTime<Utc>>,
}

/// Shared task registry. Cloning shares the underlying map.
#[derive(Clone, Debug, Default)]
pub struct TaskStore {
  tasks: Arc<DashMap<String, TaskRecord>>,
}

impl TaskStore {
  /// Construct an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new task with an empty log and return its id.
  ///
  /// The id is the submission time with microseconds; a clash gets a `_<n>` suffix.
  pub fn create(&self, now: DateTime<Utc>) -> String {
    let base = now.format("%Y%m%d_%H%M%S_%6f").to_string();
    let mut n = 0usize;
    loop {
      let id = if n == 0 {
        base.clone()
      } else {
        format!("{base}_{n}")
      };
      match self.tasks.entry(id) {
        Entry::Vacant(slot) => {
          let id = slot.key().clone();
          slot.insert(TaskRecord::default());
          return id;
        }
        Entry::Occupied(_) => n += 1,
      }
    }
  }

  /// Append a timestamped line. Ignored once the task is terminal or unknown.
  pub fn append_log(&self, task_id: &str, message: &str) -> bool {
    let Some(mut record) = self.tasks.get_mut(task_id) else {
      return false;
    };
    if record.outcome.is_some() {
      return false;
    }
    let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
    record.log.push(format!("{ts}: {message}"));
    true
  }

  /// Store the terminal outcome. Fails if one is already stored.
  pub fn complete(&self, task_id: &str, outcome: TaskOutcome) -> Result<()> {
    let mut record = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| Error::InvalidRequest(format!("unknown task {task_id}")))?;
    if record.outcome.is_some() {
      return Err(Error::TaskAlreadyCompleted(task_id.to_string()));
    }
    record.outcome = Some(outcome);
    record.completed_at = Some(Utc::now());
    Ok(())
  }

  /// Forget tasks that reached a terminal state more than `retention` before
  /// `now`. In-progress tasks are never evicted. Returns the number removed.
  pub fn evict_completed(&self, now: DateTime<Utc>, retention: Duration) -> usize {
    let before = self.tasks.len();
    self
      .tasks
      .retain(|_, record| record.completed_at.map_or(true, |at| now - at <= retention));
    before.saturating_sub(self.tasks.len())
  }

  /// Current state; unknown and evicted ids are `NotFound`.
  pub fn state(&self, task_id: &str) -> TaskState {
    match self.tasks.get(task_id) {
      None => TaskState::NotFound,
      Some(record) => match record.outcome {
        None => TaskState::InProgress,
        Some(TaskOutcome::Success(_)) => TaskState::Success,
        Some(TaskOutcome::Failure(_)) => TaskState::Failure,
      },
    }
  }

  /// Copy of the progress log.
  pub fn log(&self, task_id: &str) -> Option<Vec<String>> {
    self.tasks.get(task_id).map(|r| r.log.clone())
  }

  /// Portfolio of a successful task.
  pub fn result(&self, task_id: &str) -> Option<Arc<Portfolio>> {
    self.tasks.get(task_id).and_then(|r| match &r.outcome {
      Some(TaskOutcome::Success(p)) => Some(Arc::clone(p)),
      _ => None,
    })
  }

  /// Sanitized message of a failed task.
  pub fn error(&self, task_id: &str) -> Option<String> {
    self.tasks.get(task_id).and_then(|r| match &r.outcome {
      Some(TaskOutcome::Failure(msg)) => Some(msg.clone()),
      _ => None,
    })
  }

  /// Number of tasks held.
  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  /// Whether no task is held.
  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }
}

/// Append-only progress log handle of one task.
#[derive(Clone, Debug)]
pub struct TaskLog {
  store: TaskStore,
  task_id: String,
}

impl TaskLog {
  /// Bind a log handle to `task_id` in `store`.
  pub fn new(store: TaskStore, task_id: impl Into<String>) -> Self {
    Self {
      store,
      task_id: task_id.into(),
    }
  }

  /// Borrow the task id.
  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  /// Append a progress line.
  pub fn write(&self, message: &str) {
    self.store.append_log(&self.task_id, message);
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn portfolio() -> Arc<Portfolio> {
    Arc::new(Portfolio::new(vec![("SPY".to_string(), 1.0)]).unwrap())
  }

  #[test]
  fn ids_are_unique_for_the_same_instant() {
    let store = TaskStore::new();
    let now = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();

    let a = store.create(now);
    let b = store.create(now);
    let c = store.create(now);
    assert_eq!(a, "20240517_093000_000000");
    assert_eq!(b, "20240517_093000_000000_1");
    assert_eq!(c, "20240517_093000_000000_2");
    assert_eq!(store.len(), 3);
  }

  #[test]
  fn lifecycle_is_monotonic() {
    let store = TaskStore::new();
    assert_eq!(store.state("missing"), TaskState::NotFound);

    let id = store.create(Utc::now());
    assert_eq!(store.state(&id), TaskState::InProgress);
    assert!(store.log(&id).unwrap().is_empty());

    store.complete(&id, TaskOutcome::Success(portfolio())).unwrap();
    assert_eq!(store.state(&id), TaskState::Success);

    let again = store.complete(&id, TaskOutcome::Failure("late".into()));
    assert!(matches!(again, Err(Error::TaskAlreadyCompleted(_))));
    assert_eq!(store.state(&id), TaskState::Success);
    assert!(store.error(&id).is_none());
    assert!(store.result(&id).is_some());
  }

  #[test]
  fn log_lines_are_timestamped_and_frozen_after_completion() {
    let store = TaskStore::new();
    let id = store.create(Utc::now());
    let log = TaskLog::new(store.clone(), id.clone());

    log.write("Starting optimizer");
    log.write("Updated ETF metadata cache");
    store.complete(&id, TaskOutcome::Failure("boom".into())).unwrap();
    log.write("too late");

    let lines = store.log(&id).unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(": Starting optimizer"));
    assert_eq!(lines[0].find(": "), Some(19));
    assert!(lines[1].ends_with("Updated ETF metadata cache"));
    assert_eq!(store.error(&id).as_deref(), Some("boom"));
  }

  #[test]
  fn completing_unknown_task_fails() {
    let store = TaskStore::new();
    assert!(store.complete("nope", TaskOutcome::Failure("x".into())).is_err());
    assert!(!store.append_log("nope", "x"));
  }

  #[test]
  fn finished_tasks_are_forgotten_after_retention() {
    let store = TaskStore::new();
    let done = store.create(Utc::now());
    let running = store.create(Utc::now());
    store.complete(&done, TaskOutcome::Success(portfolio())).unwrap();
    let hour = Duration::hours(1);

    assert_eq!(store.evict_completed(Utc::now(), hour), 0);
    assert_eq!(store.state(&done), TaskState::Success);

    assert_eq!(store.evict_completed(Utc::now() + hour * 2, hour), 1);
    assert_eq!(store.state(&done), TaskState::NotFound);
    assert!(store.result(&done).is_none());
    assert_eq!(store.state(&running), TaskState::InProgress);
    assert_eq!(store.len(), 1);
  }
}
