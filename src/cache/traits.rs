//! Core traits and types for the caching system.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Trait for entities that can be cached.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Entity type name used in log fields (e.g., "api")
  fn entity_type() -> &'static str;
}

/// Cache keys for catalog views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
  /// The list of all entries
  EntryList,
  /// A single entry by id
  Entry(Uuid),
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::EntryList => f.write_str("apis"),
      Self::Entry(id) => write!(f, "api_{}", id),
    }
  }
}

/// Stored form of a cached value: the data plus the catalog revision it was
/// read at.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub revision: i64,
  pub data: T,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_store(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Store,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Read from the catalog store (miss, stale or undecodable value)
  Store,
  /// Served from the cache
  Cache,
}
