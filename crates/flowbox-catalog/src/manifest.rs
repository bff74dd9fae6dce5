use serde::{Deserialize, Serialize};

/// Metadata describing a published piece version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceManifest {
  /// Piece name, e.g. "@flowbox/piece-slack"
  pub name: String,

  /// Semantic version, e.g. "1.0.0"
  pub version: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,

  /// Short description of what the piece does
  #[serde(default)]
  pub description: String,

  /// Oldest host release able to run this piece.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub minimum_supported_release: Option<String>,

  /// Newest host release able to run this piece.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub maximum_supported_release: Option<String>,
}

impl PieceManifest {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      display_name: None,
      description: String::new(),
      minimum_supported_release: None,
      maximum_supported_release: None,
    }
  }

  /// Returns the directory name for this piece: "name--version"
  /// with slashes replaced by double dashes.
  ///
  /// Example: "@flowbox/piece-slack" version "1.0.0"
  /// becomes "@flowbox--piece-slack--1.0.0"
  pub fn dir_name(&self) -> String {
    let sanitized_name = self.name.replace('/', "--");
    format!("{}--{}", sanitized_name, self.version)
  }
}
