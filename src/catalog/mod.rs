//! API catalog: entries, policies and products, and the service that keeps
//! the gateway and the cache in line with them.

mod policy;
mod schema;
mod service;
mod store;
mod types;
mod validate;

pub use service::CatalogService;
pub use store::CatalogStore;
pub use types::{ApiEntry, EntryInput, PolicyInput, ProductInput, ProductUpdate};
