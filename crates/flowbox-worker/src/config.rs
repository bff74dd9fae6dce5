use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest stack an execution unit thread is given, whatever the memory budget.
const MIN_STACK_BYTES: usize = 2 * 1024 * 1024;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
  /// Prepared sandbox the units read the engine runtime, pieces and code from.
  pub sandbox_root: PathBuf,

  /// Memory budget per unit in KB. Drives both the Lua heap ceiling and the
  /// unit thread's stack size.
  pub memory_limit_kb: u64,

  /// Requested number of units.
  pub concurrency: usize,

  /// Lower bound on the number of units.
  pub concurrency_floor: usize,

  /// Wall-clock deadline for one task.
  pub task_timeout: Duration,

  /// Extra time granted past the deadline before a unit is considered hung.
  pub grace_period: Duration,

  /// Environment visible to units through the `env` table.
  pub env: BTreeMap<String, String>,
}

impl WorkerPoolConfig {
  pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
    Self {
      sandbox_root: sandbox_root.into(),
      memory_limit_kb: 524_288,
      concurrency: 10,
      concurrency_floor: 5,
      task_timeout: Duration::from_secs(600),
      grace_period: Duration::from_secs(5),
      env: BTreeMap::new(),
    }
  }

  /// Number of units: `max(concurrency_floor, concurrency)`, at least one.
  pub fn pool_size(&self) -> usize {
    self.concurrency.max(self.concurrency_floor).max(1)
  }

  pub fn memory_limit_bytes(&self) -> usize {
    usize::try_from(self.memory_limit_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
  }

  pub(crate) fn stack_size(&self) -> usize {
    self.memory_limit_bytes().max(MIN_STACK_BYTES)
  }
}
