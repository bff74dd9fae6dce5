use thiserror::Error;

/// Errors that stop an operation before it reaches an execution unit.
///
/// Failures while the operation runs are not errors: they come back as a
/// non-OK [`EngineHelperResponse`](flowbox_worker::EngineHelperResponse).
#[derive(Debug, Error)]
pub enum EngineError {
  /// A piece could not be pinned to an exact version.
  #[error("resolution failed: {0}")]
  Resolve(#[from] flowbox_resolver::ResolveError),

  /// The sandbox could not be prepared.
  #[error("sandbox preparation failed: {0}")]
  Sandbox(#[from] flowbox_sandbox::SandboxError),

  #[error("worker pool error: {0}")]
  Worker(#[from] flowbox_worker::WorkerError),

  /// The operation names a step the flow version does not have.
  #[error("step not found: {0}")]
  StepNotFound(String),

  #[error("invalid value '{value}' for {name}")]
  InvalidConfig { name: String, value: String },

  #[error("could not determine the home directory; set FLOWBOX_DATA_DIR")]
  NoDataDir,

  #[error("failed to serialize engine response: {0}")]
  Serialize(#[from] serde_json::Error),
}
