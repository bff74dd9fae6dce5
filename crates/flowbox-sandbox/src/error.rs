use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a sandbox preparation.
#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("catalog error: {0}")]
  Catalog(#[from] flowbox_catalog::CatalogError),

  #[error("failed to serialize {what}: {source}")]
  Serialize {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  /// Pieces must be resolved to an exact version before installation.
  #[error("piece {0} has no exact version")]
  UnpinnedPiece(String),

  #[error("failed to install piece {piece}: {message}")]
  Install { piece: String, message: String },
}

impl SandboxError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}
