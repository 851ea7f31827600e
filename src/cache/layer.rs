//! Cache-aside layer in front of the catalog store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::storage::CacheStorage;
use super::traits::{CacheKey, CacheResult, Cacheable, Envelope};

/// How long a populated value lives unless invalidated first.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Cache layer that serves catalog reads from storage and falls back to a
/// fetcher on miss.
///
/// Values are tagged with the catalog revision they were read at and only
/// served while that revision is current, so a reader that repopulates the
/// cache between a write and its invalidation cannot pin stale data. Storage
/// failures never reach the caller: reads degrade to a miss and writes are
/// skipped with a warning.
#[derive(Clone)]
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  ttl: Duration,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
      ttl: DEFAULT_TTL,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Fetch the entry list, cache first.
  pub async fn get_list<T, E, F, Fut>(
    &self,
    revision: i64,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>, E>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
  {
    let key = CacheKey::EntryList;
    if let Some(data) = self.read::<Vec<T>>(key, revision) {
      debug!(%key, entity = T::entity_type(), "cache hit");
      return Ok(CacheResult::from_cache(data));
    }

    let data = fetcher().await?;
    self.write(key, revision, &data);
    Ok(CacheResult::from_store(data))
  }

  /// Fetch one entry, cache first. Absent entries are not cached.
  pub async fn get_entry<T, E, F, Fut>(
    &self,
    id: Uuid,
    revision: i64,
    fetcher: F,
  ) -> Result<CacheResult<Option<T>>, E>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
  {
    let key = CacheKey::Entry(id);
    if let Some(data) = self.read::<T>(key, revision) {
      debug!(%key, entity = T::entity_type(), "cache hit");
      return Ok(CacheResult::from_cache(Some(data)));
    }

    let data = fetcher().await?;
    if let Some(entity) = &data {
      self.write(key, revision, entity);
    }
    Ok(CacheResult::from_store(data))
  }

  pub fn invalidate_list(&self) {
    self.invalidate(CacheKey::EntryList);
  }

  pub fn invalidate_entry(&self, id: Uuid) {
    self.invalidate(CacheKey::Entry(id));
  }

  fn invalidate(&self, key: CacheKey) {
    match self.storage.remove(&key.to_string()) {
      Ok(()) => debug!(%key, "cache invalidated"),
      Err(e) => warn!(%key, error = %e, "cache invalidation skipped"),
    }
  }

  fn read<T: DeserializeOwned>(&self, key: CacheKey, revision: i64) -> Option<T> {
    let raw = match self.storage.get(&key.to_string()) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(%key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    match serde_json::from_str::<Envelope<T>>(&raw) {
      Ok(envelope) if envelope.revision == revision => Some(envelope.data),
      Ok(envelope) => {
        debug!(
          %key,
          cached = envelope.revision,
          current = revision,
          "cached value is stale"
        );
        None
      }
      Err(e) => {
        warn!(%key, error = %e, "undecodable cache value, dropping");
        self.invalidate(key);
        None
      }
    }
  }

  fn write<T: Serialize>(&self, key: CacheKey, revision: i64, data: &T) {
    let value = match serde_json::to_string(&Envelope { revision, data }) {
      Ok(value) => value,
      Err(e) => {
        warn!(%key, error = %e, "failed to serialize cache value");
        return;
      }
    };

    if let Err(e) = self.storage.set(&key.to_string(), &value, self.ttl) {
      warn!(%key, error = %e, "cache write skipped");
    }
  }
}
