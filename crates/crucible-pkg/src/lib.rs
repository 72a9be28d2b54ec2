//! Packager-side data for the sandbox: the precomputed dependency manifest,
//! the canonical dependencies query used as a cache key, the combined meta
//! index of known npm files, and the on-demand dependency fetch client.

pub mod fetcher;
pub mod manifest;

pub use fetcher::{CdnFetcher, DependencyFetcher, FetchedPackage};
pub use manifest::{Dependency, DependencyInfo, Manifest, ManifestEntry};
