use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to a piece (integration module) in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PiecePackage {
  /// Piece name, e.g. "@flowbox/piece-slack"
  pub name: String,

  /// Exact version ("1.4.2") or a semver range ("^1.4.0", "~0.3.1").
  pub version: String,

  /// Exact version fixed by the resolver. Takes precedence over `version`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pinned_version: Option<String>,
}

impl PiecePackage {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      pinned_version: None,
    }
  }

  /// A package already resolved to `version`.
  pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
    let version = version.into();
    Self {
      name: name.into(),
      pinned_version: Some(version.clone()),
      version,
    }
  }

  /// The exact version, if this package has been resolved.
  pub fn exact_version(&self) -> Option<&str> {
    self.pinned_version.as_deref()
  }

  /// Returns the directory name used for this package in catalogs and the
  /// sandbox: "name--version" with slashes replaced by double dashes.
  ///
  /// Unresolved packages use the requested version string.
  pub fn dir_name(&self) -> String {
    let version = self.exact_version().unwrap_or(&self.version);
    format!("{}--{}", self.name.replace('/', "--"), version)
  }
}

impl fmt::Display for PiecePackage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.pinned_version {
      Some(pinned) => write!(f, "{}@{}", self.name, pinned),
      None => write!(f, "{}@{}", self.name, self.version),
    }
  }
}
