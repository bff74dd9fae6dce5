use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

use flowbox_catalog::PieceCatalog;
use flowbox_flow::{ArtifactKey, CodeArtifact, PiecePackage};

use crate::compiler::{ArtifactCompiler, BuildOutcome};
use crate::error::SandboxError;
use crate::installer::DependencyInstaller;
use crate::layout::SandboxLayout;

/// What a call to [`SandboxManager::prepare`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrepareSummary {
  pub compiled: Vec<ArtifactKey>,
  pub reused: Vec<ArtifactKey>,
  pub stubbed: Vec<ArtifactKey>,
  pub installed: Vec<PiecePackage>,
  pub already_present: Vec<PiecePackage>,
}

enum CodeStatus {
  Reused,
  Built(BuildOutcome),
}

/// Owner of a sandbox directory.
///
/// Built once at startup and shared by `Arc`. All mutation goes through
/// [`prepare`](Self::prepare), which holds the manager's lock from the first
/// write to the last; the guard is released on every exit path.
pub struct SandboxManager {
  layout: SandboxLayout,
  lock: Mutex<()>,
  compiler: ArtifactCompiler,
  installer: DependencyInstaller,
}

impl SandboxManager {
  pub fn new(root: impl Into<PathBuf>, catalog: Arc<dyn PieceCatalog>) -> Self {
    let layout = SandboxLayout::new(root);
    Self {
      compiler: ArtifactCompiler::new(layout.clone(), catalog.clone()),
      installer: DependencyInstaller::new(layout.clone(), catalog),
      layout,
      lock: Mutex::new(()),
    }
  }

  pub fn root(&self) -> &Path {
    self.layout.root()
  }

  pub fn layout(&self) -> &SandboxLayout {
    &self.layout
  }

  /// Hold the sandbox exclusively. `prepare` waits until the guard is dropped.
  pub async fn lock(&self) -> MutexGuard<'_, ()> {
    self.lock.lock().await
  }

  /// Make the sandbox contain `pieces` and `code_artifacts`.
  ///
  /// Artifacts compile in parallel. A LOCKED artifact with an existing module
  /// is reused; everything else is rebuilt. A compile failure becomes a stub
  /// module and does not abort the batch; any installer failure does.
  #[instrument(
    name = "sandbox_prepare",
    skip(self, pieces, code_artifacts),
    fields(
      sandbox = %self.layout.root().display(),
      pieces = pieces.len(),
      code_artifacts = code_artifacts.len(),
    )
  )]
  pub async fn prepare(
    &self,
    pieces: &[PiecePackage],
    code_artifacts: &[CodeArtifact],
  ) -> Result<PrepareSummary, SandboxError> {
    let _guard = self.lock().await;
    debug!("sandbox lock acquired");

    let root = self.layout.root();
    fs::create_dir_all(root)
      .await
      .map_err(|e| SandboxError::io(root, e))?;

    let builds = code_artifacts.iter().map(|artifact| self.prepare_code(artifact));
    let results = join_all(builds).await;

    let mut summary = PrepareSummary::default();
    for (artifact, result) in code_artifacts.iter().zip(results) {
      let key = artifact.key();
      match result? {
        CodeStatus::Reused => summary.reused.push(key),
        CodeStatus::Built(BuildOutcome::Compiled) => summary.compiled.push(key),
        CodeStatus::Built(BuildOutcome::Stubbed { .. }) => summary.stubbed.push(key),
      }
    }

    self.installer.init_manifest().await?;

    info!(pieces = ?pieces.iter().map(|p| p.to_string()).collect::<Vec<_>>(), "installing pieces in sandbox");
    let (installed, already_present) = self.installer.install_pieces(pieces).await?;
    summary.installed = installed;
    summary.already_present = already_present;

    self.installer.install_engine().await?;

    info!(
      compiled = summary.compiled.len(),
      reused = summary.reused.len(),
      stubbed = summary.stubbed.len(),
      installed = summary.installed.len(),
      "sandbox_prepared"
    );
    Ok(summary)
  }

  async fn prepare_code(&self, artifact: &CodeArtifact) -> Result<CodeStatus, SandboxError> {
    let index = self.layout.artifact_index(&artifact.key());
    if artifact.is_immutable() && fs::try_exists(&index).await.unwrap_or(false) {
      debug!(artifact = %artifact.key(), "reusing compiled artifact");
      return Ok(CodeStatus::Reused);
    }
    self.compiler.compile(artifact).await.map(CodeStatus::Built)
  }
}
