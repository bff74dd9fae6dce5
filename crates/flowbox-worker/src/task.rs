use serde::{Deserialize, Serialize};

use flowbox_flow::{EngineOperation, EngineOperationType};

/// Verdict of one task. A closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineResponseStatus {
  Ok,
  InternalError,
  MemoryLimitExceeded,
  Timeout,
}

/// Request envelope sent to an execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineWorkerTask {
  pub operation_type: EngineOperationType,
  pub operation: EngineOperation,
}

impl EngineWorkerTask {
  pub fn new(operation: EngineOperation) -> Self {
    Self {
      operation_type: operation.operation_type(),
      operation,
    }
  }
}

/// What an execution unit reports back for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
  pub status: EngineResponseStatus,
  pub response: Option<serde_json::Value>,
  pub stdout: String,
  pub stderr: String,
}

impl UnitOutcome {
  /// A non-OK outcome with no captured output.
  pub fn failed(status: EngineResponseStatus, message: impl Into<String>) -> Self {
    Self {
      status,
      response: None,
      stdout: String::new(),
      stderr: message.into(),
    }
  }
}
