//! Per-operation dispatch: resolve versions, prepare the sandbox, execute on
//! the pool and normalize the result.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument};

use flowbox_catalog::{FsPieceCatalog, PieceCatalog};
use flowbox_flow::{
  EngineOperation, ExecuteFlowOperation, ExecutePropertyOperation, ExecuteStepOperation,
  ExecuteTriggerOperation, ExecuteValidateAuthOperation, ExtractPieceMetadataOperation,
  PiecePackage, StepRef,
};
use flowbox_resolver::{CatalogResolver, VersionResolver};
use flowbox_sandbox::SandboxManager;
use flowbox_worker::{
  EngineHelperResponse, EngineWorkerTask, FlowRunResponse, PieceMetadata, PoolHandle,
  PropertyResult, RawEngineResult, StepOutput, TriggerHookResult, ValidateAuthResult,
  WorkerPool, read_results,
};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Executes engine operations.
#[async_trait]
pub trait EngineRunner: Send + Sync {
  async fn execute_flow(
    &self,
    op: ExecuteFlowOperation,
  ) -> Result<EngineHelperResponse<FlowRunResponse>, EngineError>;

  async fn execute_trigger_hook(
    &self,
    op: ExecuteTriggerOperation,
  ) -> Result<EngineHelperResponse<TriggerHookResult>, EngineError>;

  async fn execute_step(
    &self,
    op: ExecuteStepOperation,
  ) -> Result<EngineHelperResponse<StepOutput>, EngineError>;

  async fn execute_property(
    &self,
    op: ExecutePropertyOperation,
  ) -> Result<EngineHelperResponse<PropertyResult>, EngineError>;

  async fn execute_validate_auth(
    &self,
    op: ExecuteValidateAuthOperation,
  ) -> Result<EngineHelperResponse<ValidateAuthResult>, EngineError>;

  async fn extract_piece_metadata(
    &self,
    op: ExtractPieceMetadataOperation,
  ) -> Result<EngineHelperResponse<PieceMetadata>, EngineError>;

  /// Run any operation; the result is returned as JSON.
  async fn execute(
    &self,
    operation: EngineOperation,
  ) -> Result<EngineHelperResponse<serde_json::Value>, EngineError> {
    match operation {
      EngineOperation::ExecuteFlow(op) => into_json(self.execute_flow(op).await?),
      EngineOperation::ExecuteTriggerHook(op) => into_json(self.execute_trigger_hook(op).await?),
      EngineOperation::ExecuteStep(op) => into_json(self.execute_step(op).await?),
      EngineOperation::ExecuteProperty(op) => into_json(self.execute_property(op).await?),
      EngineOperation::ExecuteValidateAuth(op) => {
        into_json(self.execute_validate_auth(op).await?)
      }
      EngineOperation::ExtractPieceMetadata(op) => {
        into_json(self.extract_piece_metadata(op).await?)
      }
    }
  }
}

fn into_json<T: Serialize>(
  response: EngineHelperResponse<T>,
) -> Result<EngineHelperResponse<serde_json::Value>, EngineError> {
  let result = response.result.as_ref().map(serde_json::to_value).transpose()?;
  Ok(EngineHelperResponse {
    status: response.status,
    result,
    standard_output: response.standard_output,
    standard_error: response.standard_error,
    time_in_seconds: response.time_in_seconds,
  })
}

/// Runner backed by a shared sandbox and worker pool.
pub struct SandboxEngineRunner {
  resolver: Arc<dyn VersionResolver>,
  sandbox: Arc<SandboxManager>,
  pool: PoolHandle,
}

impl SandboxEngineRunner {
  pub fn new(
    resolver: Arc<dyn VersionResolver>,
    sandbox: Arc<SandboxManager>,
    pool: PoolHandle,
  ) -> Self {
    Self {
      resolver,
      sandbox,
      pool,
    }
  }

  /// Build the catalog, resolver, sandbox manager and pool described by
  /// `config`. The pool's units start immediately.
  pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
    let catalog: Arc<dyn PieceCatalog> = Arc::new(FsPieceCatalog::new(&config.catalog_root));

    let mut resolver = CatalogResolver::new(catalog.clone());
    if let Some(release) = &config.host_release {
      resolver = resolver.with_host_release(release)?;
    }

    let sandbox = Arc::new(SandboxManager::new(&config.sandbox_root, catalog));
    let pool = WorkerPool::initialize(config.worker_config())?;

    info!(
      catalog = %config.catalog_root.display(),
      sandbox = %config.sandbox_root.display(),
      host_release = config.host_release.as_deref().unwrap_or("any"),
      "engine_runner_ready"
    );
    Ok(Self::new(Arc::new(resolver), sandbox, pool))
  }

  pub fn pool(&self) -> &PoolHandle {
    &self.pool
  }

  pub fn sandbox(&self) -> &SandboxManager {
    &self.sandbox
  }

  /// Resolve one piece and install it.
  async fn prepare_piece(&self, piece: &PiecePackage) -> Result<PiecePackage, EngineError> {
    let exact = self.resolver.exact_piece(piece).await?;
    self.sandbox.prepare(std::slice::from_ref(&exact), &[]).await?;
    Ok(exact)
  }

  /// Send a prepared operation to the pool and normalize what comes back.
  async fn run<T: DeserializeOwned>(
    &self,
    operation: EngineOperation,
  ) -> Result<EngineHelperResponse<T>, EngineError> {
    let started = Instant::now();
    let outcome = self
      .pool
      .execute_task(EngineWorkerTask::new(operation))
      .await?;
    let elapsed = started.elapsed().as_secs_f64();

    let response = read_results::<T>(RawEngineResult::from_outcome(outcome, elapsed));
    info!(
      status = ?response.status,
      time_in_seconds = elapsed,
      "operation_finished"
    );
    Ok(response)
  }
}

#[async_trait]
impl EngineRunner for SandboxEngineRunner {
  #[instrument(
    name = "execute_flow",
    skip(self, op),
    fields(execution_id = %uuid::Uuid::new_v4(), flow_version = %op.flow_version.id)
  )]
  async fn execute_flow(
    &self,
    op: ExecuteFlowOperation,
  ) -> Result<EngineHelperResponse<FlowRunResponse>, EngineError> {
    let pieces = self.resolver.extract_flow_pieces(&op.flow_version).await?;
    let codes = op.flow_version.code_artifacts();
    self.sandbox.prepare(&pieces, &codes).await?;

    let flow_version = self.resolver.lock_flow_version(&op.flow_version).await?;
    self
      .run(EngineOperation::ExecuteFlow(ExecuteFlowOperation {
        flow_version,
        ..op
      }))
      .await
  }

  #[instrument(
    name = "execute_trigger_hook",
    skip(self, op),
    fields(
      execution_id = %uuid::Uuid::new_v4(),
      flow_version = %op.flow_version.id,
      hook = ?op.hook_type,
    )
  )]
  async fn execute_trigger_hook(
    &self,
    op: ExecuteTriggerOperation,
  ) -> Result<EngineHelperResponse<TriggerHookResult>, EngineError> {
    let trigger = &op.flow_version.trigger;
    match StepRef::Trigger(trigger).piece() {
      Some(piece) => {
        self.prepare_piece(piece).await?;
      }
      None => {
        self.sandbox.prepare(&[], &[]).await?;
      }
    }

    let flow_version = self
      .resolver
      .lock_step(&op.flow_version, &trigger.name)
      .await?;
    self
      .run(EngineOperation::ExecuteTriggerHook(ExecuteTriggerOperation {
        flow_version,
        ..op
      }))
      .await
  }

  #[instrument(
    name = "execute_step",
    skip(self, op),
    fields(
      execution_id = %uuid::Uuid::new_v4(),
      flow_version = %op.flow_version.id,
      step = %op.step_name,
    )
  )]
  async fn execute_step(
    &self,
    op: ExecuteStepOperation,
  ) -> Result<EngineHelperResponse<StepOutput>, EngineError> {
    let step = op
      .flow_version
      .get_step(&op.step_name)
      .ok_or_else(|| EngineError::StepNotFound(op.step_name.clone()))?;

    let pieces = match step.piece() {
      Some(piece) => vec![self.resolver.exact_piece(piece).await?],
      None => Vec::new(),
    };
    // Branches and loops only need the engine runtime.
    let codes = match step {
      StepRef::Action(action) => op.flow_version.code_artifact_for(action).into_iter().collect(),
      StepRef::Trigger(_) => Vec::new(),
    };
    self.sandbox.prepare(&pieces, &codes).await?;

    let flow_version = self
      .resolver
      .lock_step(&op.flow_version, &op.step_name)
      .await?;
    self
      .run(EngineOperation::ExecuteStep(ExecuteStepOperation {
        flow_version,
        ..op
      }))
      .await
  }

  #[instrument(
    name = "execute_property",
    skip(self, op),
    fields(
      execution_id = %uuid::Uuid::new_v4(),
      piece = %op.piece,
      property = %op.property_name,
    )
  )]
  async fn execute_property(
    &self,
    op: ExecutePropertyOperation,
  ) -> Result<EngineHelperResponse<PropertyResult>, EngineError> {
    let piece = self.prepare_piece(&op.piece).await?;
    self
      .run(EngineOperation::ExecuteProperty(ExecutePropertyOperation {
        piece,
        ..op
      }))
      .await
  }

  #[instrument(
    name = "execute_validate_auth",
    skip(self, op),
    fields(execution_id = %uuid::Uuid::new_v4(), piece = %op.piece)
  )]
  async fn execute_validate_auth(
    &self,
    op: ExecuteValidateAuthOperation,
  ) -> Result<EngineHelperResponse<ValidateAuthResult>, EngineError> {
    let piece = self.prepare_piece(&op.piece).await?;
    self
      .run(EngineOperation::ExecuteValidateAuth(ExecuteValidateAuthOperation {
        piece,
        ..op
      }))
      .await
  }

  #[instrument(
    name = "extract_piece_metadata",
    skip(self, op),
    fields(execution_id = %uuid::Uuid::new_v4(), piece = %op.piece)
  )]
  async fn extract_piece_metadata(
    &self,
    op: ExtractPieceMetadataOperation,
  ) -> Result<EngineHelperResponse<PieceMetadata>, EngineError> {
    let piece = self.prepare_piece(&op.piece).await?;
    self
      .run(EngineOperation::ExtractPieceMetadata(
        ExtractPieceMetadataOperation { piece },
      ))
      .await
  }
}
