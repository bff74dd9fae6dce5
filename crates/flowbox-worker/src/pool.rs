//! Fixed-size pool of execution units.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::WorkerPoolConfig;
use crate::error::WorkerError;
use crate::task::{EngineResponseStatus, EngineWorkerTask, UnitOutcome};
use crate::runtime::run_task;
use crate::unit::{TaskRunner, UnitSettings, WorkerUnit};

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
  /// Number of units, the maximum number of tasks running at once.
  pub capacity: usize,
  /// Tasks running right now.
  pub busy: usize,
  /// Highest `busy` value seen.
  pub peak_busy: usize,
  /// Tasks that produced an outcome, whatever its status.
  pub completed: u64,
  /// Units discarded after a crash or a hang and started again.
  pub replaced: u64,
}

/// A pool of `N` execution units, `N = max(concurrency_floor, concurrency)`.
///
/// Created once per process with [`WorkerPool::initialize`]. Tasks beyond `N`
/// wait for a free unit; the order in which waiters get one is unspecified.
pub struct WorkerPool {
  settings: Arc<UnitSettings>,
  runner: TaskRunner,
  stack_size: usize,
  grace_period: Duration,
  capacity: usize,
  permits: Semaphore,
  idle: Mutex<Vec<WorkerUnit>>,
  next_id: AtomicUsize,
  busy: AtomicUsize,
  peak_busy: AtomicUsize,
  completed: AtomicU64,
  replaced: AtomicU64,
  closed: CancellationToken,
}

/// Cloneable handle to an initialized [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
  pool: Arc<WorkerPool>,
}

impl WorkerPool {
  /// Start every unit of the pool.
  pub fn initialize(config: WorkerPoolConfig) -> Result<PoolHandle, WorkerError> {
    Self::start(config, run_task)
  }

  pub(crate) fn start(
    config: WorkerPoolConfig,
    runner: TaskRunner,
  ) -> Result<PoolHandle, WorkerError> {
    let capacity = config.pool_size();
    let pool = WorkerPool {
      settings: Arc::new(UnitSettings::from_config(&config)),
      runner,
      stack_size: config.stack_size(),
      grace_period: config.grace_period,
      capacity,
      permits: Semaphore::new(capacity),
      idle: Mutex::new(Vec::with_capacity(capacity)),
      next_id: AtomicUsize::new(0),
      busy: AtomicUsize::new(0),
      peak_busy: AtomicUsize::new(0),
      completed: AtomicU64::new(0),
      replaced: AtomicU64::new(0),
      closed: CancellationToken::new(),
    };

    for _ in 0..capacity {
      let unit = pool.spawn_unit()?;
      pool.idle().push(unit);
    }

    info!(
      capacity,
      memory_limit_kb = config.memory_limit_kb,
      task_timeout_secs = config.task_timeout.as_secs(),
      sandbox = %config.sandbox_root.display(),
      "worker_pool_initialized"
    );

    Ok(PoolHandle {
      pool: Arc::new(pool),
    })
  }

  fn spawn_unit(&self) -> Result<WorkerUnit, WorkerError> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    WorkerUnit::spawn(id, self.settings.clone(), self.stack_size, self.runner).map_err(WorkerError::Spawn)
  }

  fn idle(&self) -> MutexGuard<'_, Vec<WorkerUnit>> {
    self.idle.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// An idle live unit, or a new one when none is left.
  fn checkout(&self) -> Result<WorkerUnit, WorkerError> {
    loop {
      let Some(unit) = self.idle().pop() else {
        return self.spawn_unit();
      };
      if unit.is_alive() {
        return Ok(unit);
      }
      warn!(unit = unit.id(), "execution_unit_found_dead");
      self.replaced.fetch_add(1, Ordering::Relaxed);
    }
  }

  fn checkin(&self, unit: WorkerUnit) {
    if self.closed.is_cancelled() {
      return;
    }
    self.idle().push(unit);
  }

  /// Drop a crashed or hung unit and start a fresh one in its place.
  fn replace(&self, unit: WorkerUnit) {
    let id = unit.id();
    drop(unit);
    self.replaced.fetch_add(1, Ordering::Relaxed);
    if self.closed.is_cancelled() {
      return;
    }
    match self.spawn_unit() {
      Ok(fresh) => self.idle().push(fresh),
      // The next checkout spawns one instead.
      Err(e) => error!(unit = id, error = %e, "execution_unit_replacement_failed"),
    }
  }
}

impl PoolHandle {
  /// Run a task on a free unit, waiting for one if all are busy.
  #[instrument(
    name = "execute_task",
    skip(self, task),
    fields(operation_type = %task.operation_type)
  )]
  pub async fn execute_task(&self, task: EngineWorkerTask) -> Result<UnitOutcome, WorkerError> {
    let pool = &self.pool;
    let _permit = tokio::select! {
      _ = pool.closed.cancelled() => return Err(WorkerError::PoolClosed),
      permit = pool.permits.acquire() => permit.map_err(|_| WorkerError::PoolClosed)?,
    };

    let unit = pool.checkout()?;
    let _busy = BusyGuard::enter(pool);
    let unit_id = unit.id();

    let receiver = match unit.submit(task) {
      Ok(receiver) => receiver,
      Err(_) => {
        error!(unit = unit_id, "execution_unit_unreachable");
        pool.replace(unit);
        return Ok(UnitOutcome::failed(
          EngineResponseStatus::InternalError,
          "execution unit is not running",
        ));
      }
    };

    let limit = pool.settings.task_timeout + pool.grace_period;
    let outcome = match tokio::time::timeout(limit, receiver).await {
      Ok(Ok(outcome)) => {
        pool.checkin(unit);
        outcome
      }
      Ok(Err(_)) => {
        error!(unit = unit_id, "execution_unit_crashed");
        pool.replace(unit);
        UnitOutcome::failed(
          EngineResponseStatus::InternalError,
          "execution unit crashed",
        )
      }
      Err(_) => {
        // The unit ignored its own deadline; it is abandoned, not reused.
        warn!(unit = unit_id, limit_secs = limit.as_secs(), "execution_unit_hung");
        pool.replace(unit);
        UnitOutcome::failed(
          EngineResponseStatus::Timeout,
          format!("execution did not finish within {}s", limit.as_secs_f64()),
        )
      }
    };

    pool.completed.fetch_add(1, Ordering::Relaxed);
    Ok(outcome)
  }

  pub fn stats(&self) -> PoolStats {
    let pool = &self.pool;
    PoolStats {
      capacity: pool.capacity,
      busy: pool.busy.load(Ordering::Relaxed),
      peak_busy: pool.peak_busy.load(Ordering::Relaxed),
      completed: pool.completed.load(Ordering::Relaxed),
      replaced: pool.replaced.load(Ordering::Relaxed),
    }
  }

  /// Stop accepting tasks and let idle units exit. Running tasks finish.
  pub fn shutdown(&self) {
    let pool = &self.pool;
    pool.closed.cancel();
    pool.permits.close();
    pool.idle().clear();
    info!("worker_pool_shutdown");
  }

  pub fn is_closed(&self) -> bool {
    self.pool.closed.is_cancelled()
  }
}

/// Counts a task as busy for as long as it is held.
struct BusyGuard<'a> {
  pool: &'a WorkerPool,
}

impl<'a> BusyGuard<'a> {
  fn enter(pool: &'a WorkerPool) -> Self {
    let busy = pool.busy.fetch_add(1, Ordering::SeqCst) + 1;
    pool.peak_busy.fetch_max(busy, Ordering::SeqCst);
    Self { pool }
  }
}

impl Drop for BusyGuard<'_> {
  fn drop(&mut self) {
    self.pool.busy.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowbox_flow::{EngineOperation, ExecuteStepOperation, FlowVersion};
  use serde_json::json;

  /// Crashes on step `panic`, ignores its deadline on step `hang` and
  /// answers every other step at once.
  fn scripted(task: EngineWorkerTask, _settings: &UnitSettings) -> UnitOutcome {
    let EngineOperation::ExecuteStep(op) = task.operation else {
      return UnitOutcome::failed(EngineResponseStatus::InternalError, "unexpected operation");
    };
    match op.step_name.as_str() {
      "panic" => panic!("unit crashed on purpose"),
      "hang" => {
        std::thread::sleep(Duration::from_secs(2));
        UnitOutcome::failed(EngineResponseStatus::Ok, "too late")
      }
      name => UnitOutcome {
        status: EngineResponseStatus::Ok,
        response: Some(json!({ "step": name })),
        stdout: String::new(),
        stderr: String::new(),
      },
    }
  }

  fn step(name: &str) -> EngineWorkerTask {
    let flow: FlowVersion = serde_json::from_value(json!({
      "id": "fv_1",
      "flow_id": "flow_1",
      "state": "DRAFT",
      "trigger": { "name": "trigger", "type": "WEBHOOK" },
    }))
    .unwrap();
    EngineWorkerTask::new(EngineOperation::ExecuteStep(ExecuteStepOperation {
      project_id: "project_1".to_string(),
      flow_version: flow,
      step_name: name.to_string(),
      sample_data: Default::default(),
    }))
  }

  fn single_unit_pool() -> PoolHandle {
    let mut config = WorkerPoolConfig::new(std::env::temp_dir());
    config.concurrency = 1;
    config.concurrency_floor = 1;
    config.task_timeout = Duration::from_millis(100);
    config.grace_period = Duration::from_millis(100);
    WorkerPool::start(config, scripted).unwrap()
  }

  #[tokio::test]
  async fn test_crashed_unit_is_replaced() {
    let pool = single_unit_pool();

    let outcome = pool.execute_task(step("panic")).await.unwrap();
    assert_eq!(outcome.status, EngineResponseStatus::InternalError);
    assert!(outcome.stderr.contains("crashed"), "stderr: {}", outcome.stderr);
    assert_eq!(pool.stats().replaced, 1);

    let outcome = pool.execute_task(step("after")).await.unwrap();
    assert_eq!(outcome.status, EngineResponseStatus::Ok);
    assert_eq!(outcome.response, Some(json!({ "step": "after" })));
    assert_eq!(pool.stats().completed, 2);
  }

  #[tokio::test]
  async fn test_hung_unit_times_out_and_is_replaced() {
    let pool = single_unit_pool();

    let started = std::time::Instant::now();
    let outcome = pool.execute_task(step("hang")).await.unwrap();
    assert_eq!(outcome.status, EngineResponseStatus::Timeout);
    assert!(outcome.response.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.stats().replaced, 1);

    // The replacement answers while the abandoned unit is still sleeping.
    let outcome = pool.execute_task(step("after")).await.unwrap();
    assert_eq!(outcome.status, EngineResponseStatus::Ok);
    assert_eq!(pool.stats().busy, 0);
  }
}
