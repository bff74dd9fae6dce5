use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use flowbox_catalog::{PackageFile, PieceCatalog};
use flowbox_flow::PiecePackage;

use crate::error::SandboxError;
use crate::layout::{ENGINE_RUNTIME, ENGINE_RUNTIME_VERSION, SandboxLayout};

/// Contents of `sandbox.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxManifest {
  name: String,
  #[serde(default)]
  dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuntimeInfo {
  version: String,
}

/// Installs pieces, the runtime manifest and the engine runtime into a
/// sandbox. Every install is idempotent.
pub struct DependencyInstaller {
  layout: SandboxLayout,
  catalog: Arc<dyn PieceCatalog>,
}

impl DependencyInstaller {
  pub fn new(layout: SandboxLayout, catalog: Arc<dyn PieceCatalog>) -> Self {
    Self { layout, catalog }
  }

  /// Create `sandbox.json` if it does not exist yet.
  pub async fn init_manifest(&self) -> Result<(), SandboxError> {
    let path = self.layout.manifest_path();
    if path.exists() {
      return Ok(());
    }
    let manifest = SandboxManifest {
      name: "flowbox-sandbox".to_string(),
      dependencies: BTreeMap::new(),
    };
    write_json(&path, &manifest, "sandbox manifest").await
  }

  /// Install exact piece versions. Returns (installed, already present).
  pub async fn install_pieces(
    &self,
    pieces: &[PiecePackage],
  ) -> Result<(Vec<PiecePackage>, Vec<PiecePackage>), SandboxError> {
    let mut installed = Vec::new();
    let mut present = Vec::new();

    for piece in pieces {
      if self.install_piece(piece).await? {
        installed.push(piece.clone());
      } else {
        present.push(piece.clone());
      }
    }

    if !installed.is_empty() {
      self.record_pieces(&installed).await?;
    }
    Ok((installed, present))
  }

  /// Install one piece. Returns false when the exact version was already there.
  async fn install_piece(&self, piece: &PiecePackage) -> Result<bool, SandboxError> {
    let version = piece
      .exact_version()
      .ok_or_else(|| SandboxError::UnpinnedPiece(piece.to_string()))?;

    let target = self.layout.piece_dir(piece);
    if target.join("index.lua").exists() {
      debug!(piece = %piece, "piece already installed");
      return Ok(false);
    }

    let archive = self.catalog.fetch(&piece.name, version).await?;
    if !archive
      .files
      .iter()
      .any(|f| f.path == Path::new("index.lua"))
    {
      return Err(SandboxError::Install {
        piece: piece.to_string(),
        message: "package has no index.lua".to_string(),
      });
    }

    // Stage next to the target and rename, so a crash never leaves a
    // half-written package at the final path.
    let pieces_dir = self.layout.pieces_dir();
    let staging = pieces_dir.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    if let Err(e) = move_into_place(&staging, &target, &archive.files).await {
      let _ = fs::remove_dir_all(&staging).await;
      return Err(e);
    }

    info!(piece = %piece, path = %target.display(), "piece_installed");
    Ok(true)
  }

  async fn record_pieces(&self, pieces: &[PiecePackage]) -> Result<(), SandboxError> {
    let path = self.layout.manifest_path();
    let mut manifest = match fs::read_to_string(&path).await {
      Ok(content) => match serde_json::from_str(&content) {
        Ok(manifest) => manifest,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "sandbox_manifest_corrupt");
          SandboxManifest::default()
        }
      },
      Err(_) => SandboxManifest::default(),
    };
    if manifest.name.is_empty() {
      manifest.name = "flowbox-sandbox".to_string();
    }
    for piece in pieces {
      if let Some(version) = piece.exact_version() {
        manifest
          .dependencies
          .insert(piece.name.clone(), version.to_string());
      }
    }
    write_json(&path, &manifest, "sandbox manifest").await
  }

  /// Install or refresh `engine/main.lua`. Returns true when it was written.
  pub async fn install_engine(&self) -> Result<bool, SandboxError> {
    let main = self.layout.engine_main();
    let current = fs::read_to_string(&main).await.ok();
    let info: Option<RuntimeInfo> = fs::read_to_string(self.layout.engine_version_file())
      .await
      .ok()
      .and_then(|s| serde_json::from_str(&s).ok());

    let up_to_date = current.as_deref() == Some(ENGINE_RUNTIME)
      && info.is_some_and(|i| i.version == ENGINE_RUNTIME_VERSION);
    if up_to_date {
      return Ok(false);
    }

    let engine_dir = self.layout.engine_dir();
    fs::create_dir_all(&engine_dir)
      .await
      .map_err(|e| SandboxError::io(&engine_dir, e))?;
    write_file(&main, ENGINE_RUNTIME.as_bytes()).await?;
    write_json(
      &self.layout.engine_version_file(),
      &RuntimeInfo {
        version: ENGINE_RUNTIME_VERSION.to_string(),
      },
      "engine runtime info",
    )
    .await?;

    info!(path = %main.display(), version = ENGINE_RUNTIME_VERSION, "engine_installed");
    Ok(true)
  }
}

async fn move_into_place(
  staging: &Path,
  target: &Path,
  files: &[PackageFile],
) -> Result<(), SandboxError> {
  write_package_files(staging, files).await?;
  if target.exists() {
    // Leftover from an interrupted install without index.lua.
    fs::remove_dir_all(target)
      .await
      .map_err(|e| SandboxError::io(target, e))?;
  }
  fs::rename(staging, target)
    .await
    .map_err(|e| SandboxError::io(target, e))
}

/// Write every package file below `dir`. Paths that would leave `dir` are
/// rejected.
pub(crate) async fn write_package_files(
  dir: &Path,
  files: &[PackageFile],
) -> Result<(), SandboxError> {
  fs::create_dir_all(dir)
    .await
    .map_err(|e| SandboxError::io(dir, e))?;

  for file in files {
    if file
      .path
      .components()
      .any(|c| !matches!(c, Component::Normal(_)))
    {
      return Err(SandboxError::Install {
        piece: dir.display().to_string(),
        message: format!("invalid package path {}", file.path.display()),
      });
    }

    let dest = dir.join(&file.path);
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)
        .await
        .map_err(|e| SandboxError::io(parent, e))?;
    }
    write_file(&dest, &file.contents).await?;
  }
  Ok(())
}

/// Replace `path` with `contents` through a sibling temp file and a rename.
/// Readers see either the old file or the new one, never a partial write.
pub(crate) async fn write_file(path: &Path, contents: &[u8]) -> Result<(), SandboxError> {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  let temp = path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

  if let Err(e) = fs::write(&temp, contents).await {
    let _ = fs::remove_file(&temp).await;
    return Err(SandboxError::io(&temp, e));
  }
  if let Err(e) = fs::rename(&temp, path).await {
    let _ = fs::remove_file(&temp).await;
    return Err(SandboxError::io(path, e));
  }
  Ok(())
}

pub(crate) async fn write_json<T: Serialize>(
  path: &Path,
  value: &T,
  what: &'static str,
) -> Result<(), SandboxError> {
  let content =
    serde_json::to_vec_pretty(value).map_err(|source| SandboxError::Serialize { what, source })?;
  write_file(path, &content).await
}
