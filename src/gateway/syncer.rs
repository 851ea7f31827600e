//! Drives gateway resources to match a catalog entry.
//!
//! One entry maps to a service and a route sharing the entry's name, plus an
//! optional termination plugin on the route while the entry is disabled. The
//! admin API offers no transaction across these resources, so each run is a
//! strictly ordered sequence of idempotent steps. A failed step stops the run
//! and reports which step failed; steps already applied stay applied.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::catalog::ApiEntry;
use crate::error::{GatewayError, SyncError};

use super::client::{GatewayClient, PluginChange};

/// Step of a reconcile or decommission run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStep {
  Service,
  Route,
  Plugin,
  RouteDelete,
  ServiceDelete,
}

impl fmt::Display for SyncStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Service => "service",
      Self::Route => "route",
      Self::Plugin => "plugin",
      Self::RouteDelete => "route-delete",
      Self::ServiceDelete => "service-delete",
    };
    f.write_str(name)
  }
}

/// What a successful reconcile changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
  pub route_created: bool,
  pub plugin: PluginChange,
}

#[derive(Clone)]
pub struct GatewaySyncer {
  client: GatewayClient,
}

impl GatewaySyncer {
  pub fn new(client: GatewayClient) -> Self {
    Self { client }
  }

  /// Reconcile the service, route and enabled state for `entry`.
  pub async fn reconcile(&self, entry: &ApiEntry) -> Result<SyncOutcome, SyncError> {
    let name = entry.name.as_str();
    debug!(api = name, "reconciling gateway resources");

    self
      .client
      .upsert_service(name, &entry.upstream_url, &entry.tags)
      .await
      .map_err(|e| failed(SyncStep::Service, name, e))?;

    let existed = self
      .client
      .route_exists(name)
      .await
      .map_err(|e| failed(SyncStep::Route, name, e))?;

    self
      .client
      .upsert_route(
        name,
        &entry.route,
        &entry.methods,
        &entry.hosts,
        &entry.tags,
        existed,
      )
      .await
      .map_err(|e| failed(SyncStep::Route, name, e))?;

    let plugin = self
      .client
      .set_enabled(name, entry.enabled)
      .await
      .map_err(|e| failed(SyncStep::Plugin, name, e))?;

    info!(
      api = name,
      route_created = !existed,
      plugin = ?plugin,
      "gateway reconciled"
    );

    Ok(SyncOutcome {
      route_created: !existed,
      plugin,
    })
  }

  /// Remove the route and service named `name`. Already-absent resources
  /// count as removed; the service is not touched if the route delete fails.
  pub async fn decommission(&self, name: &str) -> Result<(), SyncError> {
    let route_removed = self
      .client
      .delete_route(name)
      .await
      .map_err(|e| failed(SyncStep::RouteDelete, name, e))?;

    let service_removed = self
      .client
      .delete_service(name)
      .await
      .map_err(|e| failed(SyncStep::ServiceDelete, name, e))?;

    info!(
      api = name,
      route_removed, service_removed, "gateway resources decommissioned"
    );
    Ok(())
  }
}

fn failed(step: SyncStep, name: &str, source: GatewayError) -> SyncError {
  warn!(
    api = name,
    %step,
    status = ?source.status(),
    error = %source,
    "gateway sync step failed"
  );
  SyncError { step, source }
}

/// Stable digest of the gateway state an entry asks for.
///
/// Two entries with the same fingerprint produce identical remote resources.
pub fn fingerprint(entry: &ApiEntry) -> String {
  let desired = serde_json::json!({
    "name": entry.name,
    "upstream_url": entry.upstream_url,
    "route": entry.route,
    "methods": entry.methods,
    "hosts": entry.hosts,
    "tags": entry.tags,
    "enabled": entry.enabled,
  });

  let mut hasher = Sha256::new();
  hasher.update(desired.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::ApiEntry;
  use serde_json::json;
  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn syncer(server: &MockServer) -> GatewaySyncer {
    let client = GatewayClient::with_base_url(&server.uri(), Duration::from_secs(5)).unwrap();
    GatewaySyncer::new(client)
  }

  fn orders(enabled: bool) -> ApiEntry {
    let mut entry = ApiEntry::new("orders", "/orders", "http://svc:8080");
    entry.methods = ["GET".to_string()].into();
    entry.enabled = enabled;
    entry
  }

  async fn mount(server: &MockServer, verb: &str, route: &str, status: u16, times: u64) {
    Mock::given(method(verb))
      .and(path(route))
      .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "data": [] })))
      .expect(times)
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_reconcile_new_entry_creates_route() {
    let server = MockServer::start().await;
    mount(&server, "PUT", "/services/orders", 200, 1).await;
    mount(&server, "GET", "/services/orders/routes/orders", 404, 1).await;
    mount(&server, "POST", "/services/orders/routes", 201, 1).await;
    mount(&server, "PATCH", "/routes/orders", 200, 0).await;
    mount(&server, "GET", "/routes/orders/plugins", 200, 1).await;
    mount(&server, "POST", "/routes/orders/plugins", 201, 0).await;

    let outcome = syncer(&server).reconcile(&orders(true)).await.unwrap();
    assert!(outcome.route_created);
    assert_eq!(outcome.plugin, PluginChange::Unchanged);
  }

  #[tokio::test]
  async fn test_reconcile_twice_patches_second_time() {
    let server = MockServer::start().await;
    mount(&server, "PUT", "/services/orders", 200, 2).await;
    Mock::given(method("GET"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(404))
      .up_to_n_times(1)
      .expect(1)
      .mount(&server)
      .await;
    mount(&server, "GET", "/services/orders/routes/orders", 200, 1).await;
    mount(&server, "POST", "/services/orders/routes", 201, 1).await;
    mount(&server, "PATCH", "/routes/orders", 200, 1).await;
    mount(&server, "GET", "/routes/orders/plugins", 200, 2).await;

    let syncer = syncer(&server);
    let entry = orders(true);
    syncer.reconcile(&entry).await.unwrap();
    let second = syncer.reconcile(&entry).await.unwrap();
    assert!(!second.route_created);
    assert_eq!(second.plugin, PluginChange::Unchanged);
  }

  #[tokio::test]
  async fn test_service_failure_stops_before_route() {
    let server = MockServer::start().await;
    mount(&server, "PUT", "/services/orders", 500, 1).await;
    mount(&server, "GET", "/services/orders/routes/orders", 404, 0).await;

    let err = syncer(&server).reconcile(&orders(true)).await.unwrap_err();
    assert_eq!(err.step, SyncStep::Service);
    assert_eq!(err.source.status(), Some(500));
  }

  #[tokio::test]
  async fn test_route_check_error_calls_neither_verb() {
    let server = MockServer::start().await;
    mount(&server, "PUT", "/services/orders", 200, 1).await;
    mount(&server, "GET", "/services/orders/routes/orders", 502, 1).await;
    mount(&server, "POST", "/services/orders/routes", 201, 0).await;
    mount(&server, "PATCH", "/routes/orders", 200, 0).await;
    mount(&server, "GET", "/routes/orders/plugins", 200, 0).await;

    let err = syncer(&server).reconcile(&orders(true)).await.unwrap_err();
    assert_eq!(err.step, SyncStep::Route);
    assert_eq!(err.source.status(), Some(502));
  }

  #[tokio::test]
  async fn test_decommission_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(204))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders"))
      .respond_with(ResponseTemplate::new(204))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    mount(&server, "DELETE", "/services/orders/routes/orders", 404, 1).await;
    mount(&server, "DELETE", "/services/orders", 404, 1).await;

    let syncer = syncer(&server);
    syncer.decommission("orders").await.unwrap();
    syncer.decommission("orders").await.unwrap();
  }

  #[tokio::test]
  async fn test_decommission_stops_when_route_delete_fails() {
    let server = MockServer::start().await;
    mount(&server, "DELETE", "/services/orders/routes/orders", 500, 1).await;
    mount(&server, "DELETE", "/services/orders", 204, 0).await;

    let err = syncer(&server).decommission("orders").await.unwrap_err();
    assert_eq!(err.step, SyncStep::RouteDelete);
  }

  #[test]
  fn test_fingerprint_tracks_desired_state() {
    let a = orders(true);
    let mut b = orders(true);
    assert_eq!(fingerprint(&a), fingerprint(&b));

    b.enabled = false;
    assert_ne!(fingerprint(&a), fingerprint(&b));

    // Catalog-only fields do not affect the remote state
    let mut c = orders(true);
    c.version = 7;
    assert_eq!(fingerprint(&a), fingerprint(&c));
  }
}
