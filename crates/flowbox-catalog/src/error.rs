use thiserror::Error;

/// Errors returned by piece catalogs.
#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid manifest: {0}")]
  InvalidManifest(#[from] serde_json::Error),

  #[error("piece version not found: {name}@{version}")]
  VersionNotFound { name: String, version: String },

  #[error("invalid version range '{range}': {source}")]
  InvalidRange {
    range: String,
    #[source]
    source: semver::Error,
  },
}
