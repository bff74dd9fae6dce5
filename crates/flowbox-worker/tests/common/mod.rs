//! Shared fixtures: a sandbox prepared from the repository's test pieces and a
//! pool running on it.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flowbox_catalog::FsPieceCatalog;
use flowbox_flow::{EngineOperation, FlowVersion, PiecePackage};
use flowbox_sandbox::SandboxManager;
use flowbox_worker::{PoolHandle, WorkerPool, WorkerPoolConfig};
use serde_json::json;

pub fn test_pieces() -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../test-pieces")
}

pub fn math_piece() -> PiecePackage {
  PiecePackage::pinned("@flowbox/piece-math", "1.0.0")
}

pub struct Fixture {
  pub dir: tempfile::TempDir,
  pub manager: SandboxManager,
}

impl Fixture {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(FsPieceCatalog::new(test_pieces()));
    let manager = SandboxManager::new(dir.path(), catalog);
    Self { dir, manager }
  }

  /// Install everything `flow` needs. Test flows name exact versions, which
  /// are pinned as-is.
  pub async fn prepare(&self, flow: &FlowVersion) {
    let pieces: Vec<PiecePackage> = flow
      .piece_packages()
      .into_iter()
      .map(|piece| PiecePackage::pinned(&piece.name, &piece.version))
      .collect();
    self
      .manager
      .prepare(&pieces, &flow.code_artifacts())
      .await
      .unwrap();
  }

  pub async fn prepare_piece(&self) {
    self.manager.prepare(&[math_piece()], &[]).await.unwrap();
  }

  pub fn config(&self) -> WorkerPoolConfig {
    let mut config = WorkerPoolConfig::new(self.dir.path());
    config.concurrency = 2;
    config.concurrency_floor = 1;
    config.memory_limit_kb = 64 * 1024;
    config.task_timeout = Duration::from_secs(10);
    config
  }

  pub fn pool(&self) -> PoolHandle {
    WorkerPool::initialize(self.config()).unwrap()
  }
}

/// A flow with a webhook trigger named `trigger` followed by `actions`.
pub fn flow(actions: serde_json::Value) -> FlowVersion {
  serde_json::from_value(json!({
    "id": "fv_1",
    "flow_id": "flow_1",
    "state": "DRAFT",
    "trigger": { "name": "trigger", "type": "WEBHOOK" },
    "actions": actions,
  }))
  .unwrap()
}

/// A flow with a single code step `step_1`.
pub fn code_flow(code: &str) -> FlowVersion {
  flow(json!([{
    "name": "step_1",
    "type": "CODE",
    "source_code": { "code": code },
  }]))
}

pub fn execute_step(flow: &FlowVersion, step_name: &str) -> EngineOperation {
  serde_json::from_value(json!({
    "type": "EXECUTE_STEP",
    "project_id": "project_1",
    "flow_version": flow,
    "step_name": step_name,
  }))
  .unwrap()
}

pub fn execute_flow(flow: &FlowVersion, payload: serde_json::Value) -> EngineOperation {
  serde_json::from_value(json!({
    "type": "EXECUTE_FLOW",
    "project_id": "project_1",
    "flow_version": flow,
    "trigger_payload": payload,
  }))
  .unwrap()
}
