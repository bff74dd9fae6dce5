//! Flowbox Resolver
//!
//! Turns piece references that may carry version ranges into exact versions,
//! and produces flow version snapshots in which every piece step is pinned.
//! Resolution only reads from the catalog, so it is safe to call repeatedly
//! and from many tasks at once.

mod error;
mod resolver;

pub use error::ResolveError;
pub use resolver::{CatalogResolver, VersionResolver};
