//! Flowbox Engine
//!
//! Entry point for callers: every engine operation goes through the same
//! pipeline.
//!
//! ```text
//! EngineOperation
//!   │  VersionResolver      pin piece versions, lock the flow version
//!   ▼
//!   │  SandboxManager       compile code steps, install pieces and runtime
//!   ▼
//!   │  PoolHandle           run on a free execution unit
//!   ▼
//!   │  read_results         typed EngineHelperResponse<T>
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flowbox_engine::{EngineConfig, EngineRunner, SandboxEngineRunner};
//!
//! let config = EngineConfig::from_env()?;
//! let runner = SandboxEngineRunner::from_config(&config)?;
//! let response = runner.execute(operation).await?;
//! ```

mod config;
mod error;
mod runner;

pub use config::{DEFAULT_PIECES_SOURCE, EngineConfig};
pub use error::EngineError;
pub use runner::{EngineRunner, SandboxEngineRunner};
