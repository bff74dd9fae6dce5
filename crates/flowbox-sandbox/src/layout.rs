use std::path::{Path, PathBuf};

use flowbox_flow::{ArtifactKey, PiecePackage};

/// Source of the engine runtime installed at `engine/main.lua`.
pub const ENGINE_RUNTIME: &str = include_str!("../runtime/main.lua");

/// Version recorded next to the installed engine runtime.
pub const ENGINE_RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Paths inside a sandbox directory.
///
/// ```text
/// {root}/
/// ├── sandbox.json
/// ├── engine/
/// │   ├── main.lua
/// │   └── runtime.json
/// ├── pieces/
/// │   └── @flowbox--piece-math--1.0.0/
/// └── codes/
///     └── {flow_version_id}/{step_name}/
///         ├── manifest.json
///         ├── build.json
///         ├── source.lua
///         ├── modules/{dependency}/
///         └── index.lua
/// ```
#[derive(Debug, Clone)]
pub struct SandboxLayout {
  root: PathBuf,
}

impl SandboxLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Runtime package manifest listing the installed pieces.
  pub fn manifest_path(&self) -> PathBuf {
    self.root.join("sandbox.json")
  }

  pub fn engine_dir(&self) -> PathBuf {
    self.root.join("engine")
  }

  pub fn engine_main(&self) -> PathBuf {
    self.engine_dir().join("main.lua")
  }

  pub fn engine_version_file(&self) -> PathBuf {
    self.engine_dir().join("runtime.json")
  }

  pub fn pieces_dir(&self) -> PathBuf {
    self.root.join("pieces")
  }

  pub fn piece_dir(&self, piece: &PiecePackage) -> PathBuf {
    self.pieces_dir().join(sanitize_segment(&piece.dir_name()))
  }

  pub fn codes_dir(&self) -> PathBuf {
    self.root.join("codes")
  }

  pub fn artifact_dir(&self, key: &ArtifactKey) -> PathBuf {
    self
      .codes_dir()
      .join(sanitize_segment(&key.flow_version_id))
      .join(sanitize_segment(&key.source_code_id))
  }

  /// Dependencies of a code artifact, one directory per package.
  pub fn artifact_modules_dir(&self, key: &ArtifactKey) -> PathBuf {
    self.artifact_dir(key).join("modules")
  }

  /// Compiled (or stub) module of a code artifact.
  pub fn artifact_index(&self, key: &ArtifactKey) -> PathBuf {
    self.artifact_dir(key).join("index.lua")
  }
}

/// Make an identifier safe to use as a single path segment.
///
/// Separators, `%` and NUL are percent-escaped and the dot-only names are
/// escaped whole, so distinct identifiers always map to distinct segments.
pub fn sanitize_segment(segment: &str) -> String {
  match segment {
    "" => return "%".to_string(),
    "." => return "%2E".to_string(),
    ".." => return "%2E%2E".to_string(),
    _ => {}
  }

  let mut cleaned = String::with_capacity(segment.len());
  for c in segment.chars() {
    match c {
      '%' | '/' | '\\' | ':' | '\0' => cleaned.push_str(&format!("%{:02X}", c as u32)),
      c => cleaned.push(c),
    }
  }
  cleaned
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_artifact_paths() {
    let layout = SandboxLayout::new("/sandbox");
    let key = ArtifactKey {
      flow_version_id: "fv_1".to_string(),
      source_code_id: "step_1".to_string(),
    };
    assert_eq!(
      layout.artifact_index(&key),
      PathBuf::from("/sandbox/codes/fv_1/step_1/index.lua")
    );
  }

  #[test]
  fn test_segments_cannot_escape() {
    let layout = SandboxLayout::new("/sandbox");
    let key = ArtifactKey {
      flow_version_id: "..".to_string(),
      source_code_id: "../../etc".to_string(),
    };
    let dir = layout.artifact_dir(&key);
    assert!(dir.starts_with("/sandbox/codes"));
    assert_eq!(dir, PathBuf::from("/sandbox/codes/%2E%2E/..%2F..%2Fetc"));
  }

  #[test]
  fn test_distinct_ids_get_distinct_segments() {
    let layout = SandboxLayout::new("/sandbox");
    let key = |step: &str| ArtifactKey {
      flow_version_id: "fv".to_string(),
      source_code_id: step.to_string(),
    };

    assert_ne!(layout.artifact_dir(&key("a/b")), layout.artifact_dir(&key("a_b")));
    assert_ne!(layout.artifact_dir(&key("a/b")), layout.artifact_dir(&key("a%2Fb")));
    assert_ne!(sanitize_segment(""), sanitize_segment("%"));
    assert_ne!(sanitize_segment(".."), sanitize_segment("%2E%2E"));
    assert_eq!(sanitize_segment("step_1"), "step_1");
  }

  #[test]
  fn test_piece_dir_uses_exact_version() {
    let layout = SandboxLayout::new("/sandbox");
    let piece = PiecePackage::pinned("@flowbox/piece-math", "1.2.0");
    assert_eq!(
      layout.piece_dir(&piece),
      PathBuf::from("/sandbox/pieces/@flowbox--piece-math--1.2.0")
    );
  }
}
