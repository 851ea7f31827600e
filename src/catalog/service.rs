//! Catalog operations: persist, reconcile the gateway, invalidate the cache.
//!
//! Every mutation commits to the store first, then drives the gateway, then
//! drops the affected cache keys. The gateway step can fail after the local
//! write committed; the entry's sync status records where it stopped and
//! `resync` picks it up again. Mutations are serialized through one async
//! writer lock; reads take no lock and go through the cache.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheLayer, CacheResult, CacheSource};
use crate::error::{CatalogError, CatalogResult, SyncError};
use crate::gateway::{fingerprint, GatewaySyncer, SyncStep};
use crate::proxy::{TestProxy, TestRequest, TestResponse};

use super::policy::build_policies;
use super::store::CatalogStore;
use super::types::{
  ApiEntry, ApiProduct, EntryInput, PolicyInput, ProductInput, ProductUpdate, SyncState,
  SyncStatus,
};
use super::validate;

/// Per-entry result of a resync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
  pub id: Uuid,
  pub name: String,
  pub state: SyncState,
  pub failed_step: Option<SyncStep>,
  pub message: Option<String>,
}

pub struct CatalogService {
  store: CatalogStore,
  syncer: GatewaySyncer,
  cache: CacheLayer,
  proxy: TestProxy,
  write_lock: Mutex<()>,
}

impl CatalogService {
  pub fn new(store: CatalogStore, syncer: GatewaySyncer, cache: CacheLayer, proxy: TestProxy) -> Self {
    Self {
      store,
      syncer,
      cache,
      proxy,
      write_lock: Mutex::new(()),
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub async fn list_entries(&self) -> CatalogResult<CacheResult<Vec<ApiEntry>>> {
    // Read the revision before the data so a concurrent write can only make
    // the cached copy look older than it is, never newer.
    let revision = self.store.revision()?;
    let result = self
      .cache
      .get_list(revision, || async { self.store.list_entries() })
      .await?;
    debug!(
      revision,
      cached = result.source == CacheSource::Cache,
      count = result.data.len(),
      "entries read"
    );
    Ok(result)
  }

  pub async fn get_entry(&self, id: Uuid) -> CatalogResult<CacheResult<ApiEntry>> {
    let revision = self.store.revision()?;
    let result = self
      .cache
      .get_entry(id, revision, || async { self.store.get_entry(id) })
      .await?;
    debug!(%id, revision, cached = result.source == CacheSource::Cache, "entry read");

    match result.data {
      Some(entry) => Ok(CacheResult {
        data: entry,
        source: result.source,
      }),
      None => Err(CatalogError::entry_not_found(id)),
    }
  }

  // ==========================================================================
  // Entry mutations
  // ==========================================================================

  pub async fn create_entry(&self, input: EntryInput) -> CatalogResult<ApiEntry> {
    let fields = validate::entry_fields(&input)?;
    let _guard = self.write_lock.lock().await;

    if self.store.find_entry_by_name(&fields.name)?.is_some() {
      return Err(CatalogError::validation(format!(
        "an API named {} already exists",
        fields.name
      )));
    }
    if let Some(product_id) = input.product_id {
      self.require_product_reference(product_id)?;
    }

    let mut entry = ApiEntry::new(&fields.name, &fields.route, &fields.upstream_url);
    entry.apply(fields);
    self.store.insert_entry(&entry, input.product_id)?;
    info!(api = %entry.name, id = %entry.id, "api created");

    let synced = self.sync_entry(&entry).await;
    self.invalidate(&[entry.id]);
    synced?;

    self.reload(entry.id)
  }

  /// Replace the entry's editable fields. A product id, when given, becomes
  /// the entry's only product; without one the product links stay as they are.
  pub async fn update_entry(&self, id: Uuid, input: EntryInput) -> CatalogResult<ApiEntry> {
    let fields = validate::entry_fields(&input)?;
    let _guard = self.write_lock.lock().await;

    let mut entry = self
      .store
      .get_entry(id)?
      .ok_or_else(|| CatalogError::entry_not_found(id))?;
    if let Some(product_id) = input.product_id {
      self.require_product_reference(product_id)?;
    }
    if fields.name != entry.name {
      if let Some(other) = self.store.find_entry_by_name(&fields.name)? {
        if other.id != id {
          return Err(CatalogError::validation(format!(
            "an API named {} already exists",
            fields.name
          )));
        }
      }
    }

    let previous_name = entry.name.clone();
    entry.apply(fields);
    entry.touch();
    if previous_name != entry.name {
      entry.sync.retired_names.insert(previous_name);
    }
    // A name taken back is live again
    entry.sync.retired_names.remove(&entry.name);
    self.store.update_entry(&entry, input.product_id)?;
    info!(api = %entry.name, id = %entry.id, version = entry.version, "api updated");

    let synced = self.sync_entry(&entry).await;
    self.invalidate(&[entry.id]);
    synced?;

    self.reload(entry.id)
  }

  /// Remove the entry's gateway resources, including any still held under
  /// former names, then the entry itself. The local record is kept when the
  /// gateway side cannot be removed.
  pub async fn delete_entry(&self, id: Uuid) -> CatalogResult<()> {
    let _guard = self.write_lock.lock().await;

    let entry = self
      .store
      .get_entry(id)?
      .ok_or_else(|| CatalogError::entry_not_found(id))?;

    let mut names = vec![entry.name.clone()];
    names.extend(self.unclaimed_retired_names(&entry)?);
    for name in &names {
      if let Err(e) = self.syncer.decommission(name).await {
        self.record_failure(&entry, &e);
        self.invalidate(&[entry.id]);
        return Err(e.into());
      }
    }

    self.store.delete_entry(id)?;
    self.invalidate(&[id]);
    info!(api = %entry.name, %id, "api deleted");
    Ok(())
  }

  /// Validate and store a full replacement policy set.
  pub async fn replace_policies(
    &self,
    id: Uuid,
    inputs: Vec<PolicyInput>,
  ) -> CatalogResult<ApiEntry> {
    let policies = build_policies(&inputs)?;
    let _guard = self.write_lock.lock().await;

    let mut entry = self
      .store
      .get_entry(id)?
      .ok_or_else(|| CatalogError::entry_not_found(id))?;
    entry.policies = policies;
    entry.touch();
    self.store.replace_policies(&entry)?;
    info!(
      api = %entry.name,
      count = entry.policies.len(),
      "policies replaced"
    );

    let synced = self.sync_entry(&entry).await;
    self.invalidate(&[entry.id]);
    synced?;

    self.reload(entry.id)
  }

  /// Reconcile entries whose last sync did not complete, or every entry when
  /// `all` is set.
  pub async fn resync(&self, all: bool) -> CatalogResult<Vec<SyncReport>> {
    let _guard = self.write_lock.lock().await;

    let entries = self.store.list_entries()?;
    let mut reports = Vec::new();
    let mut touched = Vec::new();

    for entry in entries {
      if !all && !entry.sync.needs_sync() {
        continue;
      }
      touched.push(entry.id);

      let report = match self.sync_entry(&entry).await {
        Ok(status) => SyncReport {
          id: entry.id,
          name: entry.name.clone(),
          state: status.state,
          failed_step: None,
          message: status.message,
        },
        Err(CatalogError::Gateway(e)) => SyncReport {
          id: entry.id,
          name: entry.name.clone(),
          state: SyncState::Failed,
          failed_step: Some(e.step),
          message: Some(e.source.to_string()),
        },
        Err(other) => {
          self.invalidate(&touched);
          return Err(other);
        }
      };
      reports.push(report);
    }

    self.invalidate(&touched);
    info!(
      checked = reports.len(),
      failed = reports
        .iter()
        .filter(|r| r.state == SyncState::Failed)
        .count(),
      "resync finished"
    );
    Ok(reports)
  }

  /// Forward a test request to the entry's upstream.
  pub async fn test_entry(&self, id: Uuid, request: TestRequest) -> CatalogResult<TestResponse> {
    let entry = self
      .store
      .get_entry(id)?
      .ok_or_else(|| CatalogError::entry_not_found(id))?;
    self.proxy.send(&entry, &request).await
  }

  // ==========================================================================
  // Products
  // ==========================================================================

  pub async fn create_product(&self, input: ProductInput) -> CatalogResult<ApiProduct> {
    let (name, description) = validate::product(&input)?;
    let _guard = self.write_lock.lock().await;

    let now = Utc::now();
    let product = ApiProduct {
      id: Uuid::new_v4(),
      name,
      description: description.filter(|d| !d.is_empty()),
      created_at: now,
      updated_at: now,
      api_count: 0,
    };
    self.store.insert_product(&product)?;
    info!(product = %product.name, id = %product.id, "product created");
    Ok(product)
  }

  pub fn list_products(&self) -> CatalogResult<Vec<ApiProduct>> {
    Ok(self.store.list_products()?)
  }

  pub fn get_product(&self, id: Uuid) -> CatalogResult<ApiProduct> {
    self
      .store
      .get_product(id)?
      .ok_or_else(|| CatalogError::product_not_found(id))
  }

  /// Rename or re-describe a product. An empty name keeps the current one;
  /// an empty description clears it.
  pub async fn update_product(&self, id: Uuid, update: ProductUpdate) -> CatalogResult<ApiProduct> {
    let name = match update.name.as_deref().map(str::trim) {
      Some(name) if !name.is_empty() => Some(validate::product_name(name)?),
      _ => None,
    };
    let description = update
      .description
      .as_deref()
      .map(validate::product_description)
      .transpose()?;
    let _guard = self.write_lock.lock().await;

    let mut product = self.get_product(id)?;
    if let Some(name) = name {
      product.name = name;
    }
    if let Some(description) = description {
      product.description = Some(description).filter(|d| !d.is_empty());
    }
    product.updated_at = Utc::now();
    self.store.update_product(&product)?;

    self.invalidate(&self.store.product_entry_ids(id)?);
    info!(product = %product.name, %id, "product updated");
    Ok(product)
  }

  /// Delete the product. Its entries stay in the catalog.
  pub async fn delete_product(&self, id: Uuid) -> CatalogResult<()> {
    let _guard = self.write_lock.lock().await;

    let members = self.store.product_entry_ids(id)?;
    if !self.store.delete_product(id)? {
      return Err(CatalogError::product_not_found(id));
    }
    self.invalidate(&members);
    info!(%id, entries = members.len(), "product deleted");
    Ok(())
  }

  pub async fn add_entry_to_product(&self, product_id: Uuid, api_id: Uuid) -> CatalogResult<ApiProduct> {
    let _guard = self.write_lock.lock().await;
    self.get_product(product_id)?;
    self.require_entry(api_id)?;

    if self.store.link_product(product_id, api_id)? {
      self.invalidate(&[api_id]);
      info!(product = %product_id, api = %api_id, "api added to product");
    } else {
      debug!(product = %product_id, api = %api_id, "api already in product");
    }
    self.get_product(product_id)
  }

  pub async fn remove_entry_from_product(
    &self,
    product_id: Uuid,
    api_id: Uuid,
  ) -> CatalogResult<ApiProduct> {
    let _guard = self.write_lock.lock().await;
    self.get_product(product_id)?;
    self.require_entry(api_id)?;

    if self.store.unlink_product(product_id, api_id)? {
      self.invalidate(&[api_id]);
      info!(product = %product_id, api = %api_id, "api removed from product");
    } else {
      debug!(product = %product_id, api = %api_id, "api not in product");
    }
    self.get_product(product_id)
  }

  pub fn list_product_entries(&self, product_id: Uuid) -> CatalogResult<Vec<ApiEntry>> {
    self.get_product(product_id)?;
    Ok(self.store.list_product_entries(product_id)?)
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  /// Reconcile `entry`, then remove what its former names still hold on the
  /// gateway, and record the outcome as its sync status.
  ///
  /// Former names that cannot be removed stay on the record for the next
  /// resync; the entry itself still counts as synced.
  async fn sync_entry(&self, entry: &ApiEntry) -> CatalogResult<SyncStatus> {
    if entry.sync.state != SyncState::Pending {
      self
        .store
        .set_sync_status(entry.id, &SyncStatus::pending(&entry.sync))?;
    }

    if let Err(e) = self.syncer.reconcile(entry).await {
      self.record_failure(entry, &e);
      return Err(e.into());
    }

    let mut status = SyncStatus::synced(fingerprint(entry));
    for previous in self.unclaimed_retired_names(entry)? {
      match self.syncer.decommission(&previous).await {
        Ok(()) => info!(api = %entry.name, %previous, "old gateway resources removed"),
        Err(e) => {
          warn!(api = %entry.name, %previous, error = %e, "old gateway resources left behind");
          status.message = Some(format!("resources named {} were not removed: {}", previous, e));
          status.retired_names.insert(previous);
        }
      }
    }
    self.store.set_sync_status(entry.id, &status)?;
    Ok(status)
  }

  /// Former names of `entry` that no other entry has taken since. A name in
  /// use elsewhere belongs to that entry's gateway resources now.
  fn unclaimed_retired_names(&self, entry: &ApiEntry) -> CatalogResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for name in &entry.sync.retired_names {
      match self.store.find_entry_by_name(name)? {
        Some(owner) if owner.id != entry.id => {
          debug!(api = %entry.name, previous = %name, owner = %owner.id, "former name reused");
        }
        _ => {
          names.insert(name.clone());
        }
      }
    }
    Ok(names)
  }

  fn record_failure(&self, entry: &ApiEntry, error: &SyncError) {
    let status = SyncStatus::failed(&entry.sync, error.step, error.source.to_string());
    if let Err(e) = self.store.set_sync_status(entry.id, &status) {
      warn!(api = %entry.name, error = %e, "failed to record sync failure");
    }
  }

  /// Drop the list key and the keys of `ids`.
  fn invalidate(&self, ids: &[Uuid]) {
    self.cache.invalidate_list();
    for id in ids {
      self.cache.invalidate_entry(*id);
    }
  }

  fn reload(&self, id: Uuid) -> CatalogResult<ApiEntry> {
    self
      .store
      .get_entry(id)?
      .ok_or_else(|| CatalogError::entry_not_found(id))
  }

  fn require_entry(&self, id: Uuid) -> CatalogResult<()> {
    self.reload(id).map(|_| ())
  }

  /// Products referenced from entry input must exist; an unknown one is bad
  /// input rather than a missing resource.
  fn require_product_reference(&self, id: Uuid) -> CatalogResult<()> {
    match self.store.get_product(id)? {
      Some(_) => Ok(()),
      None => Err(CatalogError::validation(format!("product {} does not exist", id))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::gateway::GatewayClient;
  use serde_json::json;
  use std::collections::BTreeMap;
  use std::path::Path;
  use std::time::Duration;
  use wiremock::matchers::{body_partial_json, method, path, path_regex};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn service_with_cache(server: &MockServer, cache: CacheLayer) -> CatalogService {
    let client = GatewayClient::with_base_url(&server.uri(), Duration::from_secs(5)).unwrap();
    CatalogService::new(
      CatalogStore::open_in_memory().unwrap(),
      GatewaySyncer::new(client),
      cache,
      TestProxy::new(Duration::from_secs(5)).unwrap(),
    )
  }

  fn service(server: &MockServer) -> CatalogService {
    service_with_cache(server, CacheLayer::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn shared_cache(path: &Path) -> (CacheLayer, SqliteStorage) {
    let layer = CacheLayer::new(SqliteStorage::open(path).unwrap());
    (layer, SqliteStorage::open(path).unwrap())
  }

  fn input(name: &str) -> EntryInput {
    EntryInput {
      name: name.to_string(),
      route: format!("/{name}"),
      upstream_url: "http://svc:8080".into(),
      methods: vec!["GET".into()],
      hosts: Vec::new(),
      tags: Vec::new(),
      enabled: true,
      product_id: None,
    }
  }

  /// Gateway that accepts everything and never has existing routes.
  async fn mount_gateway(server: &MockServer) {
    let ok = |status: u16| ResponseTemplate::new(status).set_body_json(json!({ "data": [] }));
    Mock::given(method("PUT"))
      .and(path_regex(r"^/services/[^/]+$"))
      .respond_with(ok(200))
      .mount(server)
      .await;
    Mock::given(method("GET"))
      .and(path_regex(r"^/services/[^/]+/routes/[^/]+$"))
      .respond_with(ResponseTemplate::new(404))
      .mount(server)
      .await;
    Mock::given(method("POST"))
      .and(path_regex(r"^/services/[^/]+/routes$"))
      .respond_with(ok(201))
      .mount(server)
      .await;
    Mock::given(method("GET"))
      .and(path_regex(r"^/routes/[^/]+/plugins$"))
      .respond_with(ok(200))
      .mount(server)
      .await;
    Mock::given(method("POST"))
      .and(path_regex(r"^/routes/[^/]+/plugins$"))
      .respond_with(ok(201))
      .mount(server)
      .await;
    Mock::given(method("DELETE"))
      .respond_with(ResponseTemplate::new(204))
      .mount(server)
      .await;
  }

  async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
  }

  async fn delete_count(server: &MockServer) -> usize {
    server
      .received_requests()
      .await
      .unwrap_or_default()
      .iter()
      .filter(|r| r.method.as_str() == "DELETE")
      .count()
  }

  /// Mount a gateway whose first service PUT for `name` fails.
  async fn mount_gateway_failing_once(server: &MockServer, name: &str) {
    Mock::given(method("PUT"))
      .and(path(format!("/services/{name}")))
      .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
      .up_to_n_times(1)
      .mount(server)
      .await;
    mount_gateway(server).await;
  }

  async fn expect_delete(server: &MockServer, name: &str, times: u64) {
    Mock::given(method("DELETE"))
      .and(path(format!("/services/{name}/routes/{name}")))
      .respond_with(ResponseTemplate::new(204))
      .expect(times)
      .mount(server)
      .await;
    Mock::given(method("DELETE"))
      .and(path(format!("/services/{name}")))
      .respond_with(ResponseTemplate::new(204))
      .expect(times)
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_create_then_disable_orders() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/services/orders"))
      .respond_with(ResponseTemplate::new(200))
      .expect(2)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(404))
      .up_to_n_times(1)
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/services/orders/routes"))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("PATCH"))
      .and(path("/routes/orders"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/routes/orders/plugins"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
      .expect(2)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/routes/orders/plugins"))
      .and(body_partial_json(json!({
        "name": "request-termination",
        "config": { "status_code": 503, "message": "API is disabled" }
      })))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    assert_eq!(created.sync.state, SyncState::Synced);
    assert_eq!(created.version, 1);

    let mut disabled = input("orders");
    disabled.enabled = false;
    let updated = service.update_entry(created.id, disabled).await.unwrap();
    assert!(!updated.enabled);
    assert_eq!(updated.version, 2);
    assert_eq!(updated.sync.state, SyncState::Synced);
    assert_eq!(updated.sync.fingerprint, Some(fingerprint(&updated)));
  }

  #[tokio::test]
  async fn test_reads_are_cached_until_mutation() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();

    assert_eq!(service.get_entry(created.id).await.unwrap().source, CacheSource::Store);
    let cached = service.get_entry(created.id).await.unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data.name, "orders");

    service.list_entries().await.unwrap();
    assert_eq!(service.list_entries().await.unwrap().source, CacheSource::Cache);

    let mut changed = input("orders");
    changed.upstream_url = "http://svc:9090".into();
    service.update_entry(created.id, changed).await.unwrap();

    let fresh = service.get_entry(created.id).await.unwrap();
    assert_eq!(fresh.source, CacheSource::Store);
    assert_eq!(fresh.data.upstream_url, "http://svc:9090");
    let list = service.list_entries().await.unwrap();
    assert_eq!(list.source, CacheSource::Store);
    assert_eq!(list.data[0].upstream_url, "http://svc:9090");
  }

  #[tokio::test]
  async fn test_poisoned_cache_is_replaced_after_mutation() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let (cache, storage) = shared_cache(&dir.path().join("cache.db"));
    let service = service_with_cache(&server, cache);
    let created = service.create_entry(input("orders")).await.unwrap();

    let mut stale = created.clone();
    stale.upstream_url = "http://stale:1".into();
    let key = format!("api_{}", created.id);
    let poison = json!({ "revision": service.store.revision().unwrap(), "data": stale });
    storage
      .set(&key, &poison.to_string(), Duration::from_secs(60))
      .unwrap();
    assert_eq!(
      service.get_entry(created.id).await.unwrap().data.upstream_url,
      "http://stale:1"
    );

    let mut changed = input("orders");
    changed.tags = vec!["billing".into()];
    service.update_entry(created.id, changed).await.unwrap();

    let fresh = service.get_entry(created.id).await.unwrap();
    assert_eq!(fresh.data.upstream_url, "http://svc:8080");
    assert!(fresh.data.tags.contains("billing"));
  }

  #[tokio::test]
  async fn test_value_cached_before_a_write_is_never_served_after_it() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let (cache, storage) = shared_cache(&dir.path().join("cache.db"));
    let service = service_with_cache(&server, cache);
    let created = service.create_entry(input("orders")).await.unwrap();
    let before = service.store.revision().unwrap();

    let mut disabled = input("orders");
    disabled.enabled = false;
    service.update_entry(created.id, disabled).await.unwrap();

    // A reader that fetched before the write repopulates after invalidation.
    let late = json!({ "revision": before, "data": created });
    storage
      .set(&format!("api_{}", created.id), &late.to_string(), Duration::from_secs(60))
      .unwrap();

    let read = service.get_entry(created.id).await.unwrap();
    assert_eq!(read.source, CacheSource::Store);
    assert!(!read.data.enabled);
  }

  #[tokio::test]
  async fn test_invalid_input_has_no_side_effects() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);
    service.create_entry(input("orders")).await.unwrap();
    let calls = request_count(&server).await;
    let revision = service.store.revision().unwrap();

    let mut bad_route = input("billing");
    bad_route.route = "billing".into();
    let mut unknown_product = input("billing");
    unknown_product.product_id = Some(Uuid::new_v4());

    for bad in [bad_route, unknown_product, input("orders")] {
      let err = service.create_entry(bad).await.unwrap_err();
      assert!(matches!(err, CatalogError::Validation(_)), "{err}");
    }
    let err = service
      .replace_policies(
        service.store.list_entries().unwrap()[0].id,
        vec![PolicyInput {
          kind: "rate-limiting".into(),
          configuration: "[]".into(),
        }],
      )
      .await
      .unwrap_err();
    assert!(matches!(err, CatalogError::Validation(_)));

    assert_eq!(request_count(&server).await, calls);
    assert_eq!(service.store.revision().unwrap(), revision);
    assert_eq!(service.store.list_entries().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_unknown_ids_are_not_found() {
    let server = MockServer::start().await;
    let service = service(&server);
    let id = Uuid::new_v4();

    assert!(matches!(
      service.get_entry(id).await.unwrap_err(),
      CatalogError::NotFound { kind: "api", .. }
    ));
    assert!(matches!(
      service.update_entry(id, input("orders")).await.unwrap_err(),
      CatalogError::NotFound { .. }
    ));
    assert!(matches!(
      service.delete_entry(id).await.unwrap_err(),
      CatalogError::NotFound { .. }
    ));
    assert!(matches!(
      service.delete_product(id).await.unwrap_err(),
      CatalogError::NotFound { kind: "product", .. }
    ));
    assert_eq!(request_count(&server).await, 0);
  }

  #[tokio::test]
  async fn test_gateway_failure_keeps_write_and_records_step() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
      .mount(&server)
      .await;

    let service = service(&server);
    let err = service.create_entry(input("orders")).await.unwrap_err();
    match &err {
      CatalogError::Gateway(e) => assert_eq!(e.step, SyncStep::Service),
      other => panic!("unexpected error: {other}"),
    }

    let stored = service.store.find_entry_by_name("orders").unwrap().unwrap();
    assert_eq!(stored.sync.state, SyncState::Failed);
    assert_eq!(stored.sync.failed_step, Some(SyncStep::Service));
    assert!(stored.sync.message.unwrap().contains("boom"));
  }

  #[tokio::test]
  async fn test_resync_redrives_failed_entries() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;
    let service = service(&server);
    assert!(service.create_entry(input("orders")).await.is_err());

    server.reset().await;
    mount_gateway(&server).await;

    let reports = service.resync(false).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "orders");
    assert_eq!(reports[0].state, SyncState::Synced);

    assert!(service.resync(false).await.unwrap().is_empty());
    assert_eq!(service.resync(true).await.unwrap().len(), 1);

    let entry = service.list_entries().await.unwrap().data.remove(0);
    assert_eq!(entry.sync.state, SyncState::Synced);
    assert!(entry.sync.synced_at.is_some());
  }

  #[tokio::test]
  async fn test_resync_reports_failures() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);
    service.create_entry(input("orders")).await.unwrap();

    server.reset().await;
    Mock::given(method("PUT"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let reports = service.resync(true).await.unwrap();
    assert_eq!(reports[0].state, SyncState::Failed);
    assert_eq!(reports[0].failed_step, Some(SyncStep::Route));
  }

  #[tokio::test]
  async fn test_delete_removes_remote_then_local() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders"))
      .respond_with(ResponseTemplate::new(404))
      .expect(1)
      .mount(&server)
      .await;
    mount_gateway(&server).await;

    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    service.get_entry(created.id).await.unwrap();

    service.delete_entry(created.id).await.unwrap();
    assert!(matches!(
      service.get_entry(created.id).await.unwrap_err(),
      CatalogError::NotFound { .. }
    ));
    assert!(service.list_entries().await.unwrap().data.is_empty());
  }

  #[tokio::test]
  async fn test_failed_decommission_keeps_local_record() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();

    server.reset().await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(500))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders"))
      .respond_with(ResponseTemplate::new(204))
      .expect(0)
      .mount(&server)
      .await;

    let err = service.delete_entry(created.id).await.unwrap_err();
    assert_eq!(err.exit_code(), 4);

    let kept = service.get_entry(created.id).await.unwrap().data;
    assert_eq!(kept.sync.state, SyncState::Failed);
    assert_eq!(kept.sync.failed_step, Some(SyncStep::RouteDelete));
  }

  #[tokio::test]
  async fn test_rename_retires_old_resources() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders/routes/orders"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/services/orders"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("PUT"))
      .and(path("/services/orders-v2"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;
    mount_gateway(&server).await;

    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    let mut renamed = input("orders-v2");
    renamed.route = "/orders".into();

    let updated = service.update_entry(created.id, renamed).await.unwrap();
    assert_eq!(updated.name, "orders-v2");
    assert_eq!(updated.sync.state, SyncState::Synced);
    assert!(updated.sync.message.is_none());
  }

  #[tokio::test]
  async fn test_rename_survives_failed_cleanup() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    mount_gateway(&server).await;

    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    let updated = service
      .update_entry(created.id, input("orders-v2"))
      .await
      .unwrap();
    assert_eq!(updated.sync.state, SyncState::Synced);
    assert!(updated.sync.retired_names.contains("orders"));
    assert!(updated.sync.message.as_ref().unwrap().contains("orders"));
    assert!(updated.sync.needs_sync());
  }

  #[tokio::test]
  async fn test_resync_removes_resources_left_by_a_failed_rename() {
    let server = MockServer::start().await;
    expect_delete(&server, "orders", 1).await;
    mount_gateway_failing_once(&server, "orders-v2").await;

    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    let err = service
      .update_entry(created.id, input("orders-v2"))
      .await
      .unwrap_err();
    assert!(matches!(err, CatalogError::Gateway(_)));

    // Old resources keep serving until the new ones exist
    assert_eq!(delete_count(&server).await, 0);
    let stored = service.get_entry(created.id).await.unwrap().data;
    assert_eq!(stored.name, "orders-v2");
    assert_eq!(stored.sync.state, SyncState::Failed);
    assert!(stored.sync.retired_names.contains("orders"));

    let reports = service.resync(false).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, SyncState::Synced);
    assert!(reports[0].message.is_none());
    assert_eq!(delete_count(&server).await, 2);

    let entry = service.get_entry(created.id).await.unwrap().data;
    assert!(entry.sync.retired_names.is_empty());
    assert!(service.resync(false).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_delete_removes_resources_under_former_names() {
    let server = MockServer::start().await;
    expect_delete(&server, "orders", 1).await;
    expect_delete(&server, "orders-v2", 1).await;
    mount_gateway_failing_once(&server, "orders-v2").await;

    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    assert!(service
      .update_entry(created.id, input("orders-v2"))
      .await
      .is_err());

    service.delete_entry(created.id).await.unwrap();
    assert!(service.list_entries().await.unwrap().data.is_empty());
  }

  #[tokio::test]
  async fn test_former_name_taken_by_another_entry_is_left_alone() {
    let server = MockServer::start().await;
    expect_delete(&server, "orders", 0).await;
    mount_gateway_failing_once(&server, "orders-v2").await;

    let service = service(&server);
    let first = service.create_entry(input("orders")).await.unwrap();
    assert!(service
      .update_entry(first.id, input("orders-v2"))
      .await
      .is_err());
    service.create_entry(input("orders")).await.unwrap();

    let reports = service.resync(false).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "orders-v2");
    assert_eq!(reports[0].state, SyncState::Synced);

    let first = service.get_entry(first.id).await.unwrap().data;
    assert!(first.sync.retired_names.is_empty());
  }

  #[tokio::test]
  async fn test_rename_onto_existing_name_is_rejected() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);
    let orders = service.create_entry(input("orders")).await.unwrap();
    service.create_entry(input("billing")).await.unwrap();

    let err = service
      .update_entry(orders.id, input("billing"))
      .await
      .unwrap_err();
    assert!(matches!(err, CatalogError::Validation(_)));
  }

  #[tokio::test]
  async fn test_replace_policies() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);
    let created = service.create_entry(input("orders")).await.unwrap();
    service.get_entry(created.id).await.unwrap();

    let updated = service
      .replace_policies(
        created.id,
        vec![
          PolicyInput {
            kind: "rate-limiting".into(),
            configuration: r#"{"minute": 100}"#.into(),
          },
          PolicyInput {
            kind: "x-audit".into(),
            configuration: r#"{"sink": "s3"}"#.into(),
          },
        ],
      )
      .await
      .unwrap();
    assert_eq!(updated.policies.len(), 2);
    assert_eq!(updated.version, 2);

    let read = service.get_entry(created.id).await.unwrap();
    assert_eq!(read.source, CacheSource::Store);
    assert_eq!(read.data.policies[0].kind, "rate-limiting");

    let cleared = service.replace_policies(created.id, Vec::new()).await.unwrap();
    assert!(cleared.policies.is_empty());
  }

  #[tokio::test]
  async fn test_products_track_entries() {
    let server = MockServer::start().await;
    mount_gateway(&server).await;
    let service = service(&server);

    let payments = service
      .create_product(ProductInput {
        name: "Payments".into(),
        description: Some("Money things".into()),
      })
      .await
      .unwrap();

    let mut orders_input = input("orders");
    orders_input.product_id = Some(payments.id);
    let orders = service.create_entry(orders_input).await.unwrap();
    let billing = service.create_entry(input("billing")).await.unwrap();
    assert_eq!(orders.products[0].name, "Payments");

    let product = service
      .add_entry_to_product(payments.id, billing.id)
      .await
      .unwrap();
    assert_eq!(product.api_count, 2);
    let again = service
      .add_entry_to_product(payments.id, billing.id)
      .await
      .unwrap();
    assert_eq!(again.api_count, 2);

    // Cache the entry view, then rename the product under it.
    service.get_entry(orders.id).await.unwrap();
    service
      .update_product(
        payments.id,
        ProductUpdate {
          name: Some("Billing".into()),
          description: None,
        },
      )
      .await
      .unwrap();
    let read = service.get_entry(orders.id).await.unwrap();
    assert_eq!(read.data.products[0].name, "Billing");

    let removed = service
      .remove_entry_from_product(payments.id, billing.id)
      .await
      .unwrap();
    assert_eq!(removed.api_count, 1);
    assert_eq!(service.list_product_entries(payments.id).unwrap().len(), 1);

    service.delete_product(payments.id).await.unwrap();
    assert!(service.list_products().unwrap().is_empty());
    let orphan = service.get_entry(orders.id).await.unwrap();
    assert!(orphan.data.products.is_empty());
  }

  #[tokio::test]
  async fn test_update_product_keeps_name_when_empty() {
    let server = MockServer::start().await;
    let service = service(&server);
    let product = service
      .create_product(ProductInput {
        name: "Payments".into(),
        description: Some("old".into()),
      })
      .await
      .unwrap();

    let updated = service
      .update_product(
        product.id,
        ProductUpdate {
          name: Some("  ".into()),
          description: Some(String::new()),
        },
      )
      .await
      .unwrap();
    assert_eq!(updated.name, "Payments");
    assert!(updated.description.is_none());
    assert!(updated.updated_at >= product.updated_at);
  }

  #[tokio::test]
  async fn test_entry_test_request_reaches_upstream() {
    let gateway = MockServer::start().await;
    mount_gateway(&gateway).await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/health"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&upstream)
      .await;

    let service = service(&gateway);
    let mut health = input("health");
    health.upstream_url = format!("{}/health", upstream.uri());
    let created = service.create_entry(health).await.unwrap();

    let response = service
      .test_entry(
        created.id,
        TestRequest {
          method: "GET".into(),
          headers: BTreeMap::new(),
          body: None,
        },
      )
      .await
      .unwrap();
    assert_eq!(response.status_code, 204);

    let err = service
      .test_entry(
        Uuid::new_v4(),
        TestRequest {
          method: "GET".into(),
          headers: BTreeMap::new(),
          body: None,
        },
      )
      .await
      .unwrap_err();
    assert!(matches!(err, CatalogError::NotFound { .. }));
  }
}
