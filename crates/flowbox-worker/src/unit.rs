//! Execution units: one OS thread each, running one task at a time.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error};

use flowbox_sandbox::SandboxLayout;

use crate::config::WorkerPoolConfig;
use crate::task::{EngineWorkerTask, UnitOutcome};

/// What every unit needs to run a task. Shared by all units of a pool.
#[derive(Debug, Clone)]
pub(crate) struct UnitSettings {
  pub layout: SandboxLayout,
  pub memory_limit_bytes: usize,
  pub task_timeout: Duration,
  pub env: BTreeMap<String, String>,
}

impl UnitSettings {
  pub(crate) fn from_config(config: &WorkerPoolConfig) -> Self {
    Self {
      layout: SandboxLayout::new(&config.sandbox_root),
      memory_limit_bytes: config.memory_limit_bytes(),
      task_timeout: config.task_timeout,
      env: config.env.clone(),
    }
  }
}

/// The program a unit runs for each task.
pub(crate) type TaskRunner = fn(EngineWorkerTask, &UnitSettings) -> UnitOutcome;

struct Job {
  task: EngineWorkerTask,
  reply: oneshot::Sender<UnitOutcome>,
}

/// Handle to a running unit. Dropping it lets the thread exit once its
/// current task is done.
pub(crate) struct WorkerUnit {
  id: usize,
  jobs: mpsc::Sender<Job>,
  thread: JoinHandle<()>,
}

impl WorkerUnit {
  pub(crate) fn spawn(
    id: usize,
    settings: Arc<UnitSettings>,
    stack_size: usize,
    runner: TaskRunner,
  ) -> std::io::Result<Self> {
    let (jobs, receiver) = mpsc::channel();
    let thread = thread::Builder::new()
      .name(format!("flowbox-unit-{}", id))
      .stack_size(stack_size)
      .spawn(move || unit_loop(id, &settings, runner, receiver))?;
    Ok(Self { id, jobs, thread })
  }

  pub(crate) fn id(&self) -> usize {
    self.id
  }

  pub(crate) fn is_alive(&self) -> bool {
    !self.thread.is_finished()
  }

  /// Hand a task to the unit. Fails when the unit's thread has exited.
  pub(crate) fn submit(
    &self,
    task: EngineWorkerTask,
  ) -> Result<oneshot::Receiver<UnitOutcome>, EngineWorkerTask> {
    let (reply, receiver) = oneshot::channel();
    self
      .jobs
      .send(Job { task, reply })
      .map_err(|mpsc::SendError(job)| job.task)?;
    Ok(receiver)
  }
}

fn unit_loop(id: usize, settings: &UnitSettings, runner: TaskRunner, jobs: mpsc::Receiver<Job>) {
  debug!(unit = id, "execution_unit_started");
  while let Ok(Job { task, reply }) = jobs.recv() {
    let operation_type = task.operation_type;
    match panic::catch_unwind(AssertUnwindSafe(|| runner(task, settings))) {
      Ok(outcome) => {
        // The caller may have given up waiting.
        let _ = reply.send(outcome);
      }
      Err(_) => {
        // Dropping the reply tells the pool this unit is gone.
        error!(unit = id, %operation_type, "execution_unit_panicked");
        return;
      }
    }
  }
  debug!(unit = id, "execution_unit_stopped");
}
