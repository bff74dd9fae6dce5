//! Flowbox Worker
//!
//! A fixed-size pool of isolated execution units. Each unit is a dedicated
//! OS thread that runs one engine operation at a time inside a fresh Lua
//! state with a heap ceiling, a wall-clock deadline and captured output.
//!
//! The pool is created once with [`WorkerPool::initialize`] and the returned
//! [`PoolHandle`] is cloned to every caller. [`read_results`] turns a raw unit
//! outcome into a typed [`EngineHelperResponse`].

mod config;
mod env;
mod error;
mod pool;
mod result;
mod runtime;
mod task;
mod unit;

pub use config::WorkerPoolConfig;
pub use env::{
  BASE_CODE_DIRECTORY_VAR, DIAGNOSTICS_VAR, PIECES_SOURCE_VAR, unit_environment,
};
pub use error::WorkerError;
pub use pool::{PoolHandle, PoolStats, WorkerPool};
pub use result::{EngineHelperResponse, RawEngineResult, read_results};
pub use runtime::input::{InputError, SchemaType, coerce_inputs, render_inputs, render_value};
pub use runtime::output::{
  ActionMetadata, FailedStep, FlowRunResponse, FlowRunStatus, PieceMetadata, PropertyResult,
  StepOutput, StepStatus, TriggerHookResult, TriggerMetadata, ValidateAuthResult,
};
pub use task::{EngineResponseStatus, EngineWorkerTask, UnitOutcome};
