use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use flowbox_catalog::{PieceCatalog, PieceManifest};
use flowbox_flow::{FlowVersion, FlowVersionState, PiecePackage};

use crate::error::ResolveError;

/// Pins piece references to exact catalog versions.
#[async_trait]
pub trait VersionResolver: Send + Sync {
  /// Resolve a single piece reference.
  ///
  /// A pinned version wins; an exact version is looked up directly; a range
  /// resolves to the highest matching version the host release accepts.
  async fn exact_piece(&self, piece: &PiecePackage) -> Result<PiecePackage, ResolveError>;

  /// Resolve every piece referenced by the flow version, deduplicated.
  async fn extract_flow_pieces(
    &self,
    flow_version: &FlowVersion,
  ) -> Result<Vec<PiecePackage>, ResolveError>;

  /// Copy of the flow version with only the named step pinned.
  async fn lock_step(
    &self,
    flow_version: &FlowVersion,
    step_name: &str,
  ) -> Result<FlowVersion, ResolveError>;

  /// Copy of the flow version with every piece step pinned and the state set
  /// to [`FlowVersionState::Locked`].
  async fn lock_flow_version(
    &self,
    flow_version: &FlowVersion,
  ) -> Result<FlowVersion, ResolveError>;
}

/// Resolver backed by a piece catalog.
pub struct CatalogResolver<C: PieceCatalog> {
  catalog: C,
  host_release: Option<semver::Version>,
}

impl<C: PieceCatalog> CatalogResolver<C> {
  /// Create a resolver that accepts any declared release window.
  pub fn new(catalog: C) -> Self {
    Self {
      catalog,
      host_release: None,
    }
  }

  /// Reject pieces whose supported release window excludes `release`.
  pub fn with_host_release(mut self, release: &str) -> Result<Self, ResolveError> {
    self.host_release = Some(parse_version(release)?);
    Ok(self)
  }

  /// Manifest of an exact version; its release window must admit the host.
  async fn exact_manifest(
    &self,
    piece: &PiecePackage,
    version: &str,
  ) -> Result<PieceManifest, ResolveError> {
    let manifest = self
      .catalog
      .manifest(&piece.name, version)
      .await?
      .ok_or_else(|| ResolveError::PieceNotFound {
        name: piece.name.clone(),
        version: version.to_string(),
      })?;
    self.check_release(&manifest)?;
    Ok(manifest)
  }

  /// Highest version matching the range whose release window admits the
  /// host. When versions match but none is admitted, the error of the highest
  /// one is returned.
  async fn latest_compatible(&self, piece: &PiecePackage) -> Result<PieceManifest, ResolveError> {
    let req = semver::VersionReq::parse(&piece.version).map_err(|e| ResolveError::InvalidVersion {
      version: piece.version.clone(),
      message: e.to_string(),
    })?;

    let mut candidates: Vec<semver::Version> = self
      .catalog
      .versions(&piece.name)
      .await?
      .iter()
      .filter_map(|v| semver::Version::parse(v).ok())
      .filter(|v| req.matches(v))
      .collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));

    let mut rejected = None;
    for version in candidates {
      let Some(manifest) = self.catalog.manifest(&piece.name, &version.to_string()).await? else {
        continue;
      };
      match self.check_release(&manifest) {
        Ok(()) => return Ok(manifest),
        Err(e @ ResolveError::UnsupportedRelease { .. }) => {
          debug!(piece = %piece.name, version = %version, "skipping piece version outside host release");
          if rejected.is_none() {
            rejected = Some(e);
          }
        }
        Err(e) => return Err(e),
      }
    }
    Err(rejected.unwrap_or_else(|| not_found(piece)))
  }

  fn check_release(&self, manifest: &PieceManifest) -> Result<(), ResolveError> {
    let Some(host) = &self.host_release else {
      return Ok(());
    };

    let minimum = manifest
      .minimum_supported_release
      .as_deref()
      .map(parse_version)
      .transpose()?;
    let maximum = manifest
      .maximum_supported_release
      .as_deref()
      .map(parse_version)
      .transpose()?;

    let too_old = minimum.as_ref().is_some_and(|min| host < min);
    let too_new = maximum.as_ref().is_some_and(|max| host > max);
    if too_old || too_new {
      return Err(ResolveError::UnsupportedRelease {
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        host_release: host.to_string(),
        minimum: manifest
          .minimum_supported_release
          .clone()
          .unwrap_or_else(|| "*".to_string()),
        maximum: manifest
          .maximum_supported_release
          .clone()
          .unwrap_or_else(|| "*".to_string()),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl<C: PieceCatalog> VersionResolver for CatalogResolver<C> {
  async fn exact_piece(&self, piece: &PiecePackage) -> Result<PiecePackage, ResolveError> {
    let manifest = match piece.exact_version() {
      Some(pinned) => self.exact_manifest(piece, pinned).await?,
      None if semver::Version::parse(&piece.version).is_ok() => {
        self.exact_manifest(piece, &piece.version).await?
      }
      None => self.latest_compatible(piece).await?,
    };

    debug!(piece = %piece.name, requested = %piece.version, resolved = %manifest.version, "resolved piece version");
    Ok(PiecePackage::pinned(piece.name.clone(), manifest.version))
  }

  async fn extract_flow_pieces(
    &self,
    flow_version: &FlowVersion,
  ) -> Result<Vec<PiecePackage>, ResolveError> {
    let mut requested = HashSet::new();
    let mut resolved = Vec::new();

    for piece in flow_version.piece_packages() {
      if !requested.insert(piece.clone()) {
        continue;
      }
      let exact = self.exact_piece(piece).await?;
      if !resolved.contains(&exact) {
        resolved.push(exact);
      }
    }

    Ok(resolved)
  }

  async fn lock_step(
    &self,
    flow_version: &FlowVersion,
    step_name: &str,
  ) -> Result<FlowVersion, ResolveError> {
    let step = flow_version
      .get_step(step_name)
      .ok_or_else(|| ResolveError::StepNotFound(step_name.to_string()))?;

    let mut locked = flow_version.clone();
    if let Some(piece) = step.piece() {
      let exact = self.exact_piece(piece).await?;
      if let Some(slot) = locked.step_piece_mut(step_name) {
        *slot = exact;
      }
    }
    Ok(locked)
  }

  async fn lock_flow_version(
    &self,
    flow_version: &FlowVersion,
  ) -> Result<FlowVersion, ResolveError> {
    let mut locked = flow_version.clone();
    for step_name in flow_version.piece_step_names() {
      let Some(piece) = flow_version.get_step(&step_name).and_then(|s| s.piece()) else {
        continue;
      };
      let exact = self.exact_piece(piece).await?;
      if let Some(slot) = locked.step_piece_mut(&step_name) {
        *slot = exact;
      }
    }
    locked.state = FlowVersionState::Locked;
    Ok(locked)
  }
}

fn parse_version(version: &str) -> Result<semver::Version, ResolveError> {
  semver::Version::parse(version).map_err(|e| ResolveError::InvalidVersion {
    version: version.to_string(),
    message: e.to_string(),
  })
}

fn not_found(piece: &PiecePackage) -> ResolveError {
  ResolveError::PieceNotFound {
    name: piece.name.clone(),
    version: piece.version.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowbox_catalog::{CatalogError, PackageArchive};
  use serde_json::json;
  use std::collections::HashMap;
  use std::sync::Mutex;

  /// Mock piece catalog for testing.
  struct MockCatalog {
    manifests: Mutex<HashMap<String, PieceManifest>>,
  }

  impl MockCatalog {
    fn new() -> Self {
      Self {
        manifests: Mutex::new(HashMap::new()),
      }
    }

    fn add_piece(&self, name: &str, version: &str) {
      self.add_manifest(PieceManifest::new(name, version));
    }

    fn add_manifest(&self, manifest: PieceManifest) {
      let key = format!("{}@{}", manifest.name, manifest.version);
      self.manifests.lock().unwrap().insert(key, manifest);
    }
  }

  #[async_trait]
  impl PieceCatalog for MockCatalog {
    async fn versions(&self, name: &str) -> Result<Vec<String>, CatalogError> {
      let manifests = self.manifests.lock().unwrap();
      Ok(
        manifests
          .values()
          .filter(|m| m.name == name)
          .map(|m| m.version.clone())
          .collect(),
      )
    }

    async fn manifest(
      &self,
      name: &str,
      version: &str,
    ) -> Result<Option<PieceManifest>, CatalogError> {
      let manifests = self.manifests.lock().unwrap();
      Ok(manifests.get(&format!("{}@{}", name, version)).cloned())
    }

    async fn fetch(&self, _name: &str, _version: &str) -> Result<PackageArchive, CatalogError> {
      unimplemented!("not needed for tests")
    }
  }

  fn flow_with_pieces() -> FlowVersion {
    serde_json::from_value(json!({
      "id": "fv_1",
      "flow_id": "flow_1",
      "state": "DRAFT",
      "trigger": {
        "name": "trigger",
        "type": "PIECE",
        "piece": { "name": "piece-schedule", "version": "~0.3.0" },
        "trigger_name": "every_hour"
      },
      "actions": [
        {
          "name": "step_1",
          "type": "PIECE",
          "piece": { "name": "piece-math", "version": "^1.0.0" },
          "action_name": "add"
        },
        {
          "name": "step_2",
          "type": "LOOP_ON_ITEMS",
          "items": "{{ trigger.items }}",
          "body": [
            {
              "name": "step_3",
              "type": "PIECE",
              "piece": { "name": "piece-math", "version": "^1.0.0" },
              "action_name": "multiply"
            }
          ]
        },
        {
          "name": "step_4",
          "type": "CODE",
          "source_code": { "code": "return 1" }
        }
      ]
    }))
    .unwrap()
  }

  fn catalog() -> MockCatalog {
    let catalog = MockCatalog::new();
    catalog.add_piece("piece-schedule", "0.3.1");
    catalog.add_piece("piece-schedule", "0.4.0");
    catalog.add_piece("piece-math", "1.0.0");
    catalog.add_piece("piece-math", "1.3.0");
    catalog.add_piece("piece-math", "2.0.0");
    catalog
  }

  #[tokio::test]
  async fn test_exact_piece_resolves_range_to_highest() {
    let resolver = CatalogResolver::new(catalog());
    let exact = resolver
      .exact_piece(&PiecePackage::new("piece-math", "^1.0.0"))
      .await
      .unwrap();
    assert_eq!(exact.exact_version(), Some("1.3.0"));
    assert_eq!(exact.version, "1.3.0");
  }

  #[tokio::test]
  async fn test_exact_piece_uses_exact_version_directly() {
    let resolver = CatalogResolver::new(catalog());
    let exact = resolver
      .exact_piece(&PiecePackage::new("piece-math", "1.0.0"))
      .await
      .unwrap();
    assert_eq!(exact.exact_version(), Some("1.0.0"));
  }

  #[tokio::test]
  async fn test_pinned_version_wins_over_range() {
    let resolver = CatalogResolver::new(catalog());
    let mut piece = PiecePackage::new("piece-math", "^1.0.0");
    piece.pinned_version = Some("2.0.0".to_string());

    let exact = resolver.exact_piece(&piece).await.unwrap();
    assert_eq!(exact.exact_version(), Some("2.0.0"));
  }

  #[tokio::test]
  async fn test_missing_piece() {
    let resolver = CatalogResolver::new(catalog());
    let result = resolver
      .exact_piece(&PiecePackage::new("piece-math", "^5.0.0"))
      .await;
    assert!(matches!(result, Err(ResolveError::PieceNotFound { .. })));

    let result = resolver
      .exact_piece(&PiecePackage::new("piece-math", "9.9.9"))
      .await;
    assert!(matches!(result, Err(ResolveError::PieceNotFound { .. })));
  }

  #[tokio::test]
  async fn test_invalid_range() {
    let resolver = CatalogResolver::new(catalog());
    let result = resolver
      .exact_piece(&PiecePackage::new("piece-math", "not-a-version"))
      .await;
    assert!(matches!(result, Err(ResolveError::InvalidVersion { .. })));
  }

  #[tokio::test]
  async fn test_unsupported_release() {
    let catalog = MockCatalog::new();
    let mut manifest = PieceManifest::new("piece-new", "1.0.0");
    manifest.minimum_supported_release = Some("0.40.0".to_string());
    catalog.add_manifest(manifest);
    let mut manifest = PieceManifest::new("piece-old", "1.0.0");
    manifest.maximum_supported_release = Some("0.10.0".to_string());
    catalog.add_manifest(manifest);
    let mut manifest = PieceManifest::new("piece-ok", "1.0.0");
    manifest.minimum_supported_release = Some("0.20.0".to_string());
    manifest.maximum_supported_release = Some("0.30.0".to_string());
    catalog.add_manifest(manifest);

    let resolver = CatalogResolver::new(catalog)
      .with_host_release("0.30.0")
      .unwrap();

    for name in ["piece-new", "piece-old"] {
      let result = resolver.exact_piece(&PiecePackage::new(name, "1.0.0")).await;
      assert!(matches!(result, Err(ResolveError::UnsupportedRelease { .. })));
    }
    assert!(
      resolver
        .exact_piece(&PiecePackage::new("piece-ok", "1.0.0"))
        .await
        .is_ok()
    );
  }

  #[tokio::test]
  async fn test_range_skips_versions_outside_host_release() {
    let catalog = MockCatalog::new();
    catalog.add_piece("piece-math", "1.0.0");
    let mut manifest = PieceManifest::new("piece-math", "1.1.0");
    manifest.minimum_supported_release = Some("9.0.0".to_string());
    catalog.add_manifest(manifest);
    let mut manifest = PieceManifest::new("piece-math", "1.2.0");
    manifest.minimum_supported_release = Some("9.0.0".to_string());
    catalog.add_manifest(manifest);

    let resolver = CatalogResolver::new(catalog)
      .with_host_release("1.0.0")
      .unwrap();

    let exact = resolver
      .exact_piece(&PiecePackage::new("piece-math", "^1.0.0"))
      .await
      .unwrap();
    assert_eq!(exact.exact_version(), Some("1.0.0"));

    // Exact and pinned versions are never swapped for another one.
    let result = resolver
      .exact_piece(&PiecePackage::new("piece-math", "1.2.0"))
      .await;
    assert!(matches!(result, Err(ResolveError::UnsupportedRelease { .. })));
    let result = resolver
      .exact_piece(&PiecePackage::pinned("piece-math", "1.1.0"))
      .await;
    assert!(matches!(result, Err(ResolveError::UnsupportedRelease { .. })));
  }

  #[tokio::test]
  async fn test_range_with_no_compatible_version_reports_highest() {
    let catalog = MockCatalog::new();
    for version in ["1.0.0", "1.4.0"] {
      let mut manifest = PieceManifest::new("piece-new", version);
      manifest.minimum_supported_release = Some("2.0.0".to_string());
      catalog.add_manifest(manifest);
    }

    let resolver = CatalogResolver::new(catalog)
      .with_host_release("1.0.0")
      .unwrap();
    let result = resolver
      .exact_piece(&PiecePackage::new("piece-new", "^1.0.0"))
      .await;

    match result {
      Err(ResolveError::UnsupportedRelease { version, .. }) => assert_eq!(version, "1.4.0"),
      other => panic!("unexpected result: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_extract_flow_pieces_deduplicates() {
    let resolver = CatalogResolver::new(catalog());
    let pieces = resolver
      .extract_flow_pieces(&flow_with_pieces())
      .await
      .unwrap();

    assert_eq!(
      pieces,
      vec![
        PiecePackage::pinned("piece-schedule", "0.3.1"),
        PiecePackage::pinned("piece-math", "1.3.0"),
      ]
    );
  }

  #[tokio::test]
  async fn test_lock_step_pins_only_that_step() {
    let resolver = CatalogResolver::new(catalog());
    let flow = flow_with_pieces();
    let locked = resolver.lock_step(&flow, "step_3").await.unwrap();

    let piece = |name: &str| locked.get_step(name).and_then(|s| s.piece().cloned()).unwrap();
    assert_eq!(piece("step_3").exact_version(), Some("1.3.0"));
    assert_eq!(piece("step_1").exact_version(), None);
    assert_eq!(locked.state, FlowVersionState::Draft);
  }

  #[tokio::test]
  async fn test_lock_step_missing_step() {
    let resolver = CatalogResolver::new(catalog());
    let result = resolver.lock_step(&flow_with_pieces(), "nope").await;
    assert!(matches!(result, Err(ResolveError::StepNotFound(_))));
  }

  #[tokio::test]
  async fn test_lock_flow_version_pins_every_piece_step() {
    let resolver = CatalogResolver::new(catalog());
    let locked = resolver
      .lock_flow_version(&flow_with_pieces())
      .await
      .unwrap();

    assert!(locked.is_locked());
    assert!(locked.piece_packages().iter().all(|p| p.exact_version().is_some()));
    let trigger_piece = locked.get_step("trigger").and_then(|s| s.piece().cloned()).unwrap();
    assert_eq!(trigger_piece.exact_version(), Some("0.3.1"));
  }
}
