use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::catalog::{PackageArchive, PackageFile, PieceCatalog};
use crate::error::CatalogError;
use crate::manifest::PieceManifest;

/// Filesystem-based piece catalog.
///
/// Pieces are stored in a directory structure:
/// ```text
/// {root}/
/// └── @flowbox--piece-slack--1.0.0/
///     ├── manifest.json
///     ├── index.lua
///     └── lib/ (optional)
/// ```
pub struct FsPieceCatalog {
  root: PathBuf,
}

impl FsPieceCatalog {
  /// Create a new filesystem catalog at the given root path.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Get the root directory of the catalog.
  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Parse a directory name into (name, version).
  /// Example: "@flowbox--piece-slack--1.0.0" -> ("@flowbox/piece-slack", "1.0.0")
  fn parse_dir_name(dir_name: &str) -> Option<(String, String)> {
    // Find the last "--" which separates name from version
    let last_sep = dir_name.rfind("--")?;
    let name_part = &dir_name[..last_sep];
    let version = &dir_name[last_sep + 2..];

    // Only the first "--" after the scope becomes "/"
    let name = if let Some(first_sep) = name_part.find("--") {
      format!(
        "{}/{}",
        &name_part[..first_sep],
        &name_part[first_sep + 2..]
      )
    } else {
      name_part.to_string()
    };

    Some((name, version.to_string()))
  }

  fn package_dir(&self, name: &str, version: &str) -> PathBuf {
    self
      .root
      .join(format!("{}--{}", name.replace('/', "--"), version))
  }

  async fn read_manifest(&self, package_dir: &Path) -> Result<PieceManifest, CatalogError> {
    let manifest_path = package_dir.join("manifest.json");
    let content = fs::read_to_string(&manifest_path).await?;
    let manifest: PieceManifest = serde_json::from_str(&content)?;
    Ok(manifest)
  }
}

#[async_trait]
impl PieceCatalog for FsPieceCatalog {
  async fn versions(&self, name: &str) -> Result<Vec<String>, CatalogError> {
    let mut versions = Vec::new();

    if !self.root.exists() {
      return Ok(versions);
    }

    let mut entries = fs::read_dir(&self.root).await?;
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if !path.is_dir() {
        continue;
      }

      let dir_name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => continue,
      };

      if let Some((parsed_name, parsed_version)) = Self::parse_dir_name(dir_name)
        && parsed_name == name
      {
        versions.push(parsed_version);
      }
    }

    versions.sort();
    Ok(versions)
  }

  async fn manifest(
    &self,
    name: &str,
    version: &str,
  ) -> Result<Option<PieceManifest>, CatalogError> {
    let dir = self.package_dir(name, version);
    if !dir.is_dir() {
      return Ok(None);
    }
    Ok(Some(self.read_manifest(&dir).await?))
  }

  async fn fetch(&self, name: &str, version: &str) -> Result<PackageArchive, CatalogError> {
    let dir = self.package_dir(name, version);
    if !dir.is_dir() {
      return Err(CatalogError::VersionNotFound {
        name: name.to_string(),
        version: version.to_string(),
      });
    }

    let manifest = self.read_manifest(&dir).await?;
    let mut files = Vec::new();
    read_dir_recursive(&dir, Path::new(""), &mut files).await?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(PackageArchive { manifest, files })
  }
}

/// Recursively read every file below `dir`, keyed by its path relative to the
/// package root.
async fn read_dir_recursive(
  dir: &Path,
  relative: &Path,
  out: &mut Vec<PackageFile>,
) -> Result<(), std::io::Error> {
  let mut entries = fs::read_dir(dir).await?;
  while let Some(entry) = entries.next_entry().await? {
    let src_path = entry.path();
    let rel_path = relative.join(entry.file_name());

    if src_path.is_dir() {
      Box::pin(read_dir_recursive(&src_path, &rel_path, out)).await?;
    } else {
      let contents = fs::read(&src_path).await?;
      out.push(PackageFile {
        path: rel_path,
        contents,
      });
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_dir_name_with_scope() {
    let result = FsPieceCatalog::parse_dir_name("@flowbox--piece-slack--1.0.0");
    assert_eq!(
      result,
      Some(("@flowbox/piece-slack".to_string(), "1.0.0".to_string()))
    );
  }

  #[test]
  fn test_parse_dir_name_without_scope() {
    let result = FsPieceCatalog::parse_dir_name("piece-math--2.1.0");
    assert_eq!(result, Some(("piece-math".to_string(), "2.1.0".to_string())));
  }

  #[test]
  fn test_parse_dir_name_invalid() {
    let result = FsPieceCatalog::parse_dir_name("no-version-here");
    assert_eq!(result, None);
  }
}
