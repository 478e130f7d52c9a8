use super::*;
use bloom::BloomFilter;
use bundle::{Bundle, BundleId, MetaBundle};
use thiserror::Error;

pub mod mem;

#[derive(Error, Debug)]
pub enum Error {
    /// No bundle matched the request. Callers are expected to try something else.
    #[error("No bundle found")]
    NoBundleFound,

    /// The bundle exists but could not be loaded from the backing store.
    #[error("Failed to load bundle: {0}")]
    BundleLoad(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Selects bundles from a [`BundleStorage::query`].
pub trait BundleFilter: Send + Sync {
    /// The maximum number of bundles to return.
    fn limit(&self) -> usize;

    /// Returns `true` if `meta` should be part of the result.
    fn should_add(&self, meta: &MetaBundle) -> bool;
}

/// The shared bundle store.
///
/// The store is used concurrently by every routing extension, so
/// implementations must serialize access internally.
#[async_trait]
pub trait BundleStorage: Send + Sync {
    /// Stores a bundle. Storing a bundle whose id is already present
    /// replaces it and is not an error.
    async fn store(&self, bundle: Bundle) -> Result<()>;

    /// Loads a bundle by id.
    ///
    /// # Returns
    /// * `Err(Error::NoBundleFound)` if no bundle with `id` is stored.
    async fn get(&self, id: &BundleId) -> Result<Bundle>;

    /// Collects the metadata of stored bundles accepted by `filter`, oldest
    /// first, stopping at `filter.limit()` entries.
    async fn query(&self, filter: &dyn BundleFilter) -> Result<Vec<MetaBundle>>;

    /// Removes a bundle by id and returns its metadata.
    async fn remove(&self, id: &BundleId) -> Result<MetaBundle>;

    /// Removes one bundle whose id is a member of `filter` and returns its
    /// metadata.
    ///
    /// Call repeatedly until `Err(Error::NoBundleFound)` to drain every match.
    async fn remove_matching(&self, filter: &BloomFilter) -> Result<MetaBundle>;

    /// The number of stored bundles.
    async fn count(&self) -> Result<usize>;
}
