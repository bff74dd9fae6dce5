//! Flowbox Catalog
//!
//! Access to the external catalog of piece packages. The execution core only
//! needs three things from a catalog: the versions published for a piece, the
//! contents of one exact version, and range resolution (highest matching
//! version), which has a default implementation on top of the first two.

mod catalog;
mod error;
mod fs_catalog;
mod manifest;

pub use catalog::{PackageArchive, PackageFile, PieceCatalog};
pub use error::CatalogError;
pub use fs_catalog::FsPieceCatalog;
pub use manifest::PieceManifest;
