//! Flowbox Sandbox
//!
//! The sandbox is one shared directory holding everything an execution unit
//! reads: the engine runtime, installed piece packages and compiled code
//! artifacts. It is only ever extended, and only by [`SandboxManager::prepare`],
//! which holds the manager's lock for the whole preparation.
//!
//! - [`ArtifactCompiler`] turns a code step into a Lua module, or into a stub
//!   module that raises the compilation error when it runs.
//! - [`DependencyInstaller`] installs pieces, the runtime manifest and the
//!   engine runtime idempotently.

mod compiler;
mod error;
mod installer;
mod layout;
mod manager;

pub use compiler::{ArtifactCompiler, BuildOutcome, wrap_source};
pub use error::SandboxError;
pub use installer::DependencyInstaller;
pub use layout::{ENGINE_RUNTIME, ENGINE_RUNTIME_VERSION, SandboxLayout, sanitize_segment};
pub use manager::{PrepareSummary, SandboxManager};
