//! Bounded worker pool that owns task dispatch.

use std::sync::Arc;

use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::store::TaskLog;
use super::store::TaskOutcome;
use super::store::TaskStore;
use super::TaskRunner;
use super::TaskState;
use crate::error::Error;
use crate::error::Result;
use crate::pipeline::OptimizationRequest;
use crate::quant::portfolio::Portfolio;

/// Upper bound on `retention_secs`, well inside what a `chrono::Duration` holds.
const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
  /// Tasks run concurrently.
  pub workers: usize,
  /// Submitted tasks waiting for a worker.
  pub queue_capacity: usize,
  /// Seconds a finished task stays pollable before it is forgotten.
  pub retention_secs: u64,
}

impl Default for WorkerPoolConfig {
  fn default() -> Self {
    Self {
      workers: 2,
      queue_capacity: 16,
      retention_secs: 24 * 60 * 60,
    }
  }
}

struct Job {
  task_id: String,
  request: OptimizationRequest,
}

/// Submission and polling front of the task system.
pub struct TaskOrchestrator {
  store: TaskStore,
  sender: Option<mpsc::Sender<Job>>,
  workers: Vec<JoinHandle<()>>,
  retention: Duration,
}

impl TaskOrchestrator {
  /// Spawn the workers on the current tokio runtime.
  pub fn start(runner: Arc<dyn TaskRunner>, store: TaskStore, config: &WorkerPoolConfig) -> Self {
    let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
    let receiver = Arc::new(Mutex::new(receiver));

    let workers = (0..config.workers.max(1))
      .map(|worker| {
        tokio::spawn(worker_loop(
          worker,
          Arc::clone(&receiver),
          Arc::clone(&runner),
          store.clone(),
        ))
      })
      .collect();

    Self {
      store,
      sender: Some(sender),
      workers,
      retention: Duration::seconds(config.retention_secs.min(MAX_RETENTION_SECS) as i64),
    }
  }

  /// Queue a request and return its task id without waiting for it to run.
  ///
  /// Invalid requests and a full queue are rejected before any task is created.
  pub fn submit(&self, request: OptimizationRequest) -> Result<String> {
    request.validate()?;
    let sender = self
      .sender
      .as_ref()
      .ok_or_else(|| Error::Unexpected(anyhow::anyhow!("task orchestrator is shut down")))?;
    let permit = sender.try_reserve().map_err(|e| match e {
      TrySendError::Full(()) => Error::QueueFull,
      TrySendError::Closed(()) => Error::Unexpected(anyhow::anyhow!("task queue is closed")),
    })?;

    let now = Utc::now();
    let evicted = self.store.evict_completed(now, self.retention);
    if evicted > 0 {
      tracing::debug!(evicted, "forgot expired tasks");
    }
    let task_id = self.store.create(now);
    tracing::info!(task_id = %task_id, currency = %request.currency, "Starting optimizer task");
    permit.send(Job {
      task_id: task_id.clone(),
      request,
    });
    Ok(task_id)
  }

  /// Poll the state of `task_id`.
  pub fn get_state(&self, task_id: &str) -> TaskState {
    self.store.state(task_id)
  }

  /// Progress log of `task_id`.
  pub fn get_log(&self, task_id: &str) -> Option<Vec<String>> {
    self.store.log(task_id)
  }

  /// Portfolio of a successful task.
  pub fn get_result(&self, task_id: &str) -> Option<Arc<Portfolio>> {
    self.store.result(task_id)
  }

  /// Sanitized message of a failed task.
  pub fn get_error(&self, task_id: &str) -> Option<String> {
    self.store.error(task_id)
  }

  /// Borrow the task store.
  pub fn store(&self) -> &TaskStore {
    &self.store
  }

  /// Stop accepting work and wait for queued tasks to finish.
  pub async fn shutdown(mut self) {
    self.sender.take();
    for worker in self.workers.drain(..) {
      if let Err(e) = worker.await {
        tracing::warn!(error = %e, "task worker ended abnormally");
      }
    }
  }
}

async fn worker_loop(
  worker: usize,
  jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
  runner: Arc<dyn TaskRunner>,
  store: TaskStore,
) {
  loop {
    let job = jobs.lock().await.recv().await;
    let Some(job) = job else {
      break;
    };
    tracing::debug!(worker, task_id = %job.task_id, "picked up task");
    run_job(Arc::clone(&runner), &store, job).await;
  }
  tracing::debug!(worker, "task worker stopped");
}

async fn run_job(runner: Arc<dyn TaskRunner>, store: &TaskStore, job: Job) {
  let Job { task_id, request } = job;
  let log = TaskLog::new(store.clone(), task_id.clone());

  // a panicking run surfaces as a JoinError instead of taking the worker down
  let handle = tokio::spawn(async move { runner.run(request, log).await });

  let outcome = match handle.await {
    Ok(Ok(portfolio)) => {
      tracing::info!(task_id = %task_id, "Stored results for task ID {task_id}");
      TaskOutcome::Success(Arc::new(portfolio))
    }
    Ok(Err(e)) => {
      tracing::error!(task_id = %task_id, error = ?e, "Error for task ID {task_id}: {e}");
      TaskOutcome::Failure(e.public_message(&task_id))
    }
    Err(e) => {
      tracing::error!(task_id = %task_id, error = %e, "task ID {task_id} aborted");
      let e = Error::Unexpected(anyhow::anyhow!("task aborted: {e}"));
      TaskOutcome::Failure(e.public_message(&task_id))
    }
  };

  if let Err(e) = store.complete(&task_id, outcome) {
    tracing::warn!(task_id = %task_id, error = %e, "discarding second outcome");
  }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use tokio::sync::Semaphore;
  use tokio_test::assert_ok;

  use super::*;

  /// Behaviour is keyed by the request currency.
  struct ScriptedRunner {
    gate: Semaphore,
  }

  #[async_trait]
  impl TaskRunner for ScriptedRunner {
    async fn run(&self, request: OptimizationRequest, log: TaskLog) -> Result<Portfolio> {
      log.write("Starting optimizer");
      match request.currency.as_str() {
        "DATA" => Err(Error::DataQuality {
          symbol: "BAD".into(),
          max_abs_return: 99.0,
          threshold: 50.0,
        }),
        "SECRET" => Err(Error::Unexpected(anyhow::anyhow!("db password is hunter2"))),
        "PANIC" => panic!("runner exploded"),
        "GATED" => {
          let _permit = self.gate.acquire().await.map_err(|e| Error::Unexpected(e.into()))?;
          log.write("Finished optimization");
          Portfolio::new(vec![("SPY".into(), 1.0)])
        }
        _ => {
          log.write("Finished optimization");
          Portfolio::new(vec![("SPY".into(), 0.4), ("TLT".into(), 0.6)])
        }
      }
    }
  }

  fn orchestrator(workers: usize, queue_capacity: usize) -> (TaskOrchestrator, Arc<ScriptedRunner>) {
    with_config(WorkerPoolConfig {
      workers,
      queue_capacity,
      ..WorkerPoolConfig::default()
    })
  }

  fn with_config(config: WorkerPoolConfig) -> (TaskOrchestrator, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner {
      gate: Semaphore::new(0),
    });
    let orch = TaskOrchestrator::start(runner.clone(), TaskStore::new(), &config);
    (orch, runner)
  }

  fn request(currency: &str) -> OptimizationRequest {
    OptimizationRequest {
      currency: currency.to_string(),
      ..OptimizationRequest::default()
    }
  }

  async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
      if cond() {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  #[tokio::test]
  async fn successful_task_reaches_success_with_ordered_log() {
    let (orch, _) = orchestrator(2, 4);
    let id = assert_ok!(orch.submit(request("USD")));

    wait_until(|| orch.get_state(&id).is_terminal()).await;
    assert_eq!(orch.get_state(&id), TaskState::Success);
    let log = orch.get_log(&id).unwrap();
    assert!(log[0].ends_with("Starting optimizer"));
    assert!(log[1].ends_with("Finished optimization"));
    assert_eq!(orch.get_result(&id).unwrap().to_compact_string(), "SPY:0.4|TLT:0.6");
    assert!(orch.get_error(&id).is_none());

    for _ in 0..3 {
      assert_eq!(orch.get_state(&id), TaskState::Success);
    }
    orch.shutdown().await;
  }

  #[tokio::test]
  async fn failures_are_sanitized() {
    let (orch, _) = orchestrator(2, 4);
    let data = orch.submit(request("DATA")).unwrap();
    let secret = orch.submit(request("SECRET")).unwrap();
    let panic = orch.submit(request("PANIC")).unwrap();

    wait_until(|| [&data, &secret, &panic].iter().all(|id| orch.get_state(id).is_terminal())).await;

    assert_eq!(orch.get_state(&data), TaskState::Failure);
    assert!(orch.get_error(&data).unwrap().contains("BAD"));

    let msg = orch.get_error(&secret).unwrap();
    assert!(!msg.contains("hunter2"));
    assert!(msg.contains(&secret));

    assert_eq!(orch.get_state(&panic), TaskState::Failure);
    assert!(orch.get_error(&panic).unwrap().starts_with("Unexpected error"));
    assert!(orch.get_result(&panic).is_none());

    // workers survive a panicking task
    let after = orch.submit(request("USD")).unwrap();
    wait_until(|| orch.get_state(&after).is_terminal()).await;
    assert_eq!(orch.get_state(&after), TaskState::Success);
  }

  #[tokio::test]
  async fn full_queue_rejects_without_creating_a_task() {
    let (orch, runner) = orchestrator(1, 1);

    let running = orch.submit(request("GATED")).unwrap();
    wait_until(|| orch.get_log(&running).is_some_and(|l| !l.is_empty())).await;
    let queued = orch.submit(request("GATED")).unwrap();

    assert!(matches!(orch.submit(request("GATED")), Err(Error::QueueFull)));
    assert_eq!(orch.store().len(), 2);
    assert_eq!(orch.get_state(&queued), TaskState::InProgress);

    runner.gate.add_permits(2);
    wait_until(|| orch.get_state(&queued).is_terminal()).await;
    assert_eq!(orch.get_state(&running), TaskState::Success);
    orch.shutdown().await;
  }

  #[tokio::test]
  async fn invalid_request_is_rejected_up_front() {
    let (orch, _) = orchestrator(1, 1);
    let bad = OptimizationRequest {
      target_contract_count: 0,
      ..OptimizationRequest::default()
    };

    assert!(matches!(orch.submit(bad), Err(Error::InvalidRequest(_))));
    assert!(orch.store().is_empty());
    assert_eq!(orch.get_state("20240101_000000_000000"), TaskState::NotFound);
  }

  #[tokio::test]
  async fn expired_tasks_are_forgotten_on_submit() {
    let (orch, _) = with_config(WorkerPoolConfig {
      workers: 1,
      queue_capacity: 4,
      retention_secs: 0,
    });
    let first = orch.submit(request("USD")).unwrap();
    wait_until(|| orch.get_state(&first).is_terminal()).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let second = orch.submit(request("USD")).unwrap();
    assert_eq!(orch.get_state(&first), TaskState::NotFound);
    assert!(orch.get_result(&first).is_none());
    assert_ne!(orch.get_state(&second), TaskState::NotFound);
    orch.shutdown().await;
  }
}
