//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};

/// Trait for entities that can be cached.
///
/// Implementors provide the stable remote id used as the primary key and the
/// kind name used to keep collections apart inside one store.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Stable remote identifier (e.g., episode id, character id)
  fn cache_id(&self) -> u32;

  /// Entity type name for storage organization (e.g., "episode", "character")
  fn entity_type() -> &'static str;
}

/// Indicates where the data handed back by a load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network failed, serving cached data
  Offline,
}

impl CacheSource {
  pub fn is_offline(&self) -> bool {
    matches!(self, CacheSource::Offline)
  }
}
