//! Cache-aside layer for catalog reads.
//!
//! This module provides a storage-agnostic caching mechanism that:
//! - Stores serialized views under fixed keys (`apis`, `api_{id}`) with a TTL
//! - Tags every value with the catalog revision it was read at
//! - Treats any storage failure as a miss instead of failing the read

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable};
