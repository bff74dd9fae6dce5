use thiserror::Error;

/// Errors returned by the worker pool itself. Failures inside a task are
/// reported through the task's [`UnitOutcome`](crate::UnitOutcome) instead.
#[derive(Debug, Error)]
pub enum WorkerError {
  /// The pool was shut down.
  #[error("worker pool is closed")]
  PoolClosed,

  /// An execution unit thread could not be started.
  #[error("failed to spawn execution unit: {0}")]
  Spawn(#[source] std::io::Error),
}
