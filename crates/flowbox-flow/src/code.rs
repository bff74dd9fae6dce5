use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::flow::FlowVersionState;

/// User-authored source of a code step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCode {
  /// Body of the step function. Receives `inputs` and returns the step output.
  pub code: String,

  /// Dependency manifest as JSON text: `{"dependencies": {"name": "^1.0.0"}}`.
  #[serde(default)]
  pub manifest: String,
}

#[derive(Debug, Default, Deserialize)]
struct DependencyManifest {
  #[serde(default)]
  dependencies: BTreeMap<String, String>,
}

impl SourceCode {
  pub fn new(code: impl Into<String>) -> Self {
    Self {
      code: code.into(),
      manifest: String::new(),
    }
  }

  /// Parse the declared dependencies (name -> version range).
  pub fn dependencies(&self, artifact: &str) -> Result<BTreeMap<String, String>, FlowError> {
    if self.manifest.trim().is_empty() {
      return Ok(BTreeMap::new());
    }
    let manifest: DependencyManifest =
      serde_json::from_str(&self.manifest).map_err(|source| FlowError::InvalidManifest {
        artifact: artifact.to_string(),
        source,
      })?;
    Ok(manifest.dependencies)
  }
}

/// Cache identity of a compiled code artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
  pub flow_version_id: String,
  pub source_code_id: String,
}

impl fmt::Display for ArtifactKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.flow_version_id, self.source_code_id)
  }
}

/// A code step as seen by the sandbox: source plus the state of the flow
/// version it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeArtifact {
  /// Source code id. This is the name of the step that owns the code.
  pub name: String,
  pub flow_version_id: String,
  pub flow_version_state: FlowVersionState,
  pub source_code: SourceCode,
}

impl CodeArtifact {
  pub fn key(&self) -> ArtifactKey {
    ArtifactKey {
      flow_version_id: self.flow_version_id.clone(),
      source_code_id: self.name.clone(),
    }
  }

  /// Whether a previously compiled output can be reused.
  pub fn is_immutable(&self) -> bool {
    self.flow_version_state == FlowVersionState::Locked
  }
}
