//! Flowbox Flow
//!
//! This crate holds the data model consumed by the execution core:
//! flow versions and their steps, piece package references, code artifacts,
//! and the engine operations a caller submits.
//!
//! Everything here is read-only input to the core. A [`FlowVersion`] in the
//! [`FlowVersionState::Locked`] state is an immutable snapshot, which is what
//! makes compiled code artifacts safe to cache.

mod code;
mod error;
mod flow;
mod operation;
mod piece;
mod step;

pub use code::{ArtifactKey, CodeArtifact, SourceCode};
pub use error::FlowError;
pub use flow::{FlowVersion, FlowVersionState, StepRef};
pub use operation::{
  EngineOperation, EngineOperationType, ExecuteFlowOperation, ExecutePropertyOperation,
  ExecuteStepOperation, ExecuteTriggerOperation, ExecuteValidateAuthOperation,
  ExtractPieceMetadataOperation, TriggerHookType,
};
pub use piece::PiecePackage;
pub use step::{
  Action, ActionKind, BranchCondition, BranchOperator, BranchSettings, CodeActionSettings,
  LoopSettings, PieceActionSettings, PieceTriggerSettings, Trigger, TriggerKind,
};
