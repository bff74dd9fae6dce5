//! The program an execution unit runs for each task.
//!
//! Every task gets a fresh [`Session`](session::Session): a Lua state with the
//! engine runtime loaded, a heap ceiling and a deadline hook. The operation is
//! interpreted on top of it and the typed response is serialized to JSON.

mod flow;
pub mod input;
pub mod output;
mod piece;
mod session;

use serde::Serialize;

use flowbox_flow::EngineOperation;

use crate::task::{EngineResponseStatus, EngineWorkerTask, UnitOutcome};
use crate::unit::UnitSettings;
use session::Session;

/// Why a task stopped without a response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Abort {
  Timeout,
  MemoryLimitExceeded,
  Internal(String),
}

/// An error raised while running a step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Fault {
  /// The task cannot continue.
  Abort(Abort),
  /// The step failed; the operation reports it and decides what happens next.
  Step(String),
}

impl From<Abort> for Fault {
  fn from(abort: Abort) -> Self {
    Fault::Abort(abort)
  }
}

impl From<input::InputError> for Fault {
  fn from(err: input::InputError) -> Self {
    Fault::Step(err.to_string())
  }
}

/// Turn a step result into a response: step failures become a failed
/// response, aborts end the task.
pub(crate) fn settle<T, R>(
  result: Result<T, Fault>,
  ok: impl FnOnce(T) -> R,
  failed: impl FnOnce(String) -> R,
) -> Result<R, Abort> {
  match result {
    Ok(value) => Ok(ok(value)),
    Err(Fault::Step(message)) => Ok(failed(message)),
    Err(Fault::Abort(abort)) => Err(abort),
  }
}

/// Run one task to completion on the current thread.
pub(crate) fn run_task(task: EngineWorkerTask, settings: &UnitSettings) -> UnitOutcome {
  if task.operation_type != task.operation.operation_type() {
    return UnitOutcome::failed(
      EngineResponseStatus::InternalError,
      format!(
        "operation type {} does not match a {} operation",
        task.operation_type,
        task.operation.operation_type()
      ),
    );
  }

  let mut session = match Session::open(settings) {
    Ok(session) => session,
    Err(abort) => return unavailable(abort),
  };
  let result = dispatch(&mut session, &task.operation);
  session.finish(result)
}

/// Outcome of a task whose Lua state could not be set up.
fn unavailable(abort: Abort) -> UnitOutcome {
  match abort {
    Abort::Timeout => {
      UnitOutcome::failed(EngineResponseStatus::Timeout, "execution deadline exceeded")
    }
    Abort::MemoryLimitExceeded => UnitOutcome::failed(
      EngineResponseStatus::MemoryLimitExceeded,
      "memory limit exceeded while loading the engine runtime",
    ),
    Abort::Internal(message) => UnitOutcome::failed(EngineResponseStatus::InternalError, message),
  }
}

fn dispatch(
  session: &mut Session,
  operation: &EngineOperation,
) -> Result<serde_json::Value, Abort> {
  match operation {
    EngineOperation::ExecuteFlow(op) => respond(flow::execute_flow(session, op)),
    EngineOperation::ExecuteStep(op) => respond(flow::execute_step(session, op)),
    EngineOperation::ExecuteTriggerHook(op) => respond(piece::execute_trigger_hook(session, op)),
    EngineOperation::ExecuteProperty(op) => respond(piece::execute_property(session, op)),
    EngineOperation::ExecuteValidateAuth(op) => respond(piece::execute_validate_auth(session, op)),
    EngineOperation::ExtractPieceMetadata(op) => respond(piece::extract_metadata(session, op)),
  }
}

fn respond<T: Serialize>(result: Result<T, Abort>) -> Result<serde_json::Value, Abort> {
  let response = result?;
  serde_json::to_value(&response)
    .map_err(|e| Abort::Internal(format!("failed to serialize engine response: {}", e)))
}
