//! Gateway admin API access and entry synchronization.

mod api_types;
mod client;
mod syncer;

pub use client::GatewayClient;
pub use syncer::{fingerprint, GatewaySyncer, SyncStep};
