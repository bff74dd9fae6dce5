use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::manifest::PieceManifest;

/// One file of a piece package, relative to the package root.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageFile {
  pub path: PathBuf,
  pub contents: Vec<u8>,
}

/// The full contents of one exact piece version.
#[derive(Debug, Clone)]
pub struct PackageArchive {
  pub manifest: PieceManifest,

  /// Every file of the package, `manifest.json` included.
  pub files: Vec<PackageFile>,
}

/// Catalog of published piece packages.
#[async_trait]
pub trait PieceCatalog: Send + Sync {
  /// All published versions of a piece. Empty when the piece is unknown.
  async fn versions(&self, name: &str) -> Result<Vec<String>, CatalogError>;

  /// Manifest of one exact version, if published.
  async fn manifest(
    &self,
    name: &str,
    version: &str,
  ) -> Result<Option<PieceManifest>, CatalogError>;

  /// Contents of one exact version.
  async fn fetch(&self, name: &str, version: &str) -> Result<PackageArchive, CatalogError>;

  /// Highest published version satisfying `range`, if any.
  ///
  /// Versions that are not valid semver are ignored.
  async fn resolve(&self, name: &str, range: &str) -> Result<Option<String>, CatalogError> {
    let req = semver::VersionReq::parse(range).map_err(|source| CatalogError::InvalidRange {
      range: range.to_string(),
      source,
    })?;

    let best = self
      .versions(name)
      .await?
      .into_iter()
      .filter_map(|v| semver::Version::parse(&v).ok())
      .filter(|v| req.matches(v))
      .max();

    Ok(best.map(|v| v.to_string()))
  }
}

#[async_trait]
impl<T: PieceCatalog + ?Sized> PieceCatalog for std::sync::Arc<T> {
  async fn versions(&self, name: &str) -> Result<Vec<String>, CatalogError> {
    (**self).versions(name).await
  }

  async fn manifest(
    &self,
    name: &str,
    version: &str,
  ) -> Result<Option<PieceManifest>, CatalogError> {
    (**self).manifest(name, version).await
  }

  async fn fetch(&self, name: &str, version: &str) -> Result<PackageArchive, CatalogError> {
    (**self).fetch(name, version).await
  }

  async fn resolve(&self, name: &str, range: &str) -> Result<Option<String>, CatalogError> {
    (**self).resolve(name, range).await
  }
}
