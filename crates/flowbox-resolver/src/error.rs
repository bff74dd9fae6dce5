use thiserror::Error;

/// Errors that can occur while resolving piece versions.
#[derive(Debug, Error)]
pub enum ResolveError {
  /// No published version matches the requested version or range.
  #[error("piece not found: {name}@{version}")]
  PieceNotFound { name: String, version: String },

  /// The piece declares a supported release window that excludes this host.
  #[error(
    "piece {name}@{version} does not support release {host_release} (supported: {minimum}..={maximum})"
  )]
  UnsupportedRelease {
    name: String,
    version: String,
    host_release: String,
    minimum: String,
    maximum: String,
  },

  /// A version, range or release string could not be parsed.
  #[error("invalid version '{version}': {message}")]
  InvalidVersion { version: String, message: String },

  /// The flow version has no step with this name.
  #[error("step not found: {0}")]
  StepNotFound(String),

  /// Catalog error while looking up a piece.
  #[error("catalog error: {0}")]
  Catalog(#[from] flowbox_catalog::CatalogError),
}
