use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::Cacheable;
use crate::gateway::SyncStep;

/// One logical API definition mirrored to the gateway under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEntry {
  pub id: Uuid,
  pub name: String,
  pub route: String,
  pub upstream_url: String,
  pub methods: BTreeSet<String>,
  pub hosts: BTreeSet<String>,
  pub tags: BTreeSet<String>,
  pub enabled: bool,
  #[serde(default)]
  pub policies: Vec<Policy>,
  #[serde(default)]
  pub products: Vec<ProductRef>,
  /// Bumped on every write to this entry
  pub version: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub sync: SyncStatus,
}

impl ApiEntry {
  pub fn new(name: &str, route: &str, upstream_url: &str) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      name: name.to_string(),
      route: route.to_string(),
      upstream_url: upstream_url.to_string(),
      methods: BTreeSet::new(),
      hosts: BTreeSet::new(),
      tags: BTreeSet::new(),
      enabled: true,
      policies: Vec::new(),
      products: Vec::new(),
      version: 1,
      created_at: now,
      updated_at: now,
      sync: SyncStatus::default(),
    }
  }

  /// Overwrite the user-editable fields.
  pub fn apply(&mut self, fields: EntryFields) {
    self.name = fields.name;
    self.route = fields.route;
    self.upstream_url = fields.upstream_url;
    self.methods = fields.methods;
    self.hosts = fields.hosts;
    self.tags = fields.tags;
    self.enabled = fields.enabled;
  }

  /// Product the entry currently belongs to, if any.
  pub fn active_product(&self) -> Option<Uuid> {
    self.products.first().map(|p| p.id)
  }

  pub fn touch(&mut self) {
    self.version += 1;
    self.updated_at = Utc::now();
  }
}

impl Cacheable for ApiEntry {
  fn entity_type() -> &'static str {
    "api"
  }
}

/// Validated, normalized entry fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFields {
  pub name: String,
  pub route: String,
  pub upstream_url: String,
  pub methods: BTreeSet<String>,
  pub hosts: BTreeSet<String>,
  pub tags: BTreeSet<String>,
  pub enabled: bool,
}

/// Raw input for creating or replacing an entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryInput {
  pub name: String,
  pub route: String,
  pub upstream_url: String,
  #[serde(default)]
  pub methods: Vec<String>,
  #[serde(default)]
  pub hosts: Vec<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  pub product_id: Option<Uuid>,
}

fn default_enabled() -> bool {
  true
}

/// A policy attached to an entry. `configuration` is JSON text whose shape
/// depends on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
  pub id: Uuid,
  #[serde(rename = "type")]
  pub kind: String,
  pub configuration: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyInput {
  #[serde(rename = "type")]
  pub kind: String,
  pub configuration: String,
}

/// Product reference embedded in entry views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRef {
  pub id: Uuid,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiProduct {
  pub id: Uuid,
  pub name: String,
  pub description: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Number of entries in the product
  pub api_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductInput {
  pub name: String,
  pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductUpdate {
  pub name: Option<String>,
  pub description: Option<String>,
}

// ============================================================================
// Sync status
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  /// Written locally, gateway not yet confirmed
  #[default]
  Pending,
  Synced,
  Failed,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Synced => "synced",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(Self::Pending),
      "synced" => Some(Self::Synced),
      "failed" => Some(Self::Failed),
      _ => None,
    }
  }
}

/// Last known outcome of pushing an entry to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
  pub state: SyncState,
  pub failed_step: Option<SyncStep>,
  pub message: Option<String>,
  /// Fingerprint of the desired state last applied successfully
  pub fingerprint: Option<String>,
  pub synced_at: Option<DateTime<Utc>>,
  /// Former names whose gateway resources have not been removed yet
  #[serde(default)]
  pub retired_names: BTreeSet<String>,
}

impl SyncStatus {
  pub fn synced(fingerprint: String) -> Self {
    Self {
      state: SyncState::Synced,
      failed_step: None,
      message: None,
      fingerprint: Some(fingerprint),
      synced_at: Some(Utc::now()),
      retired_names: BTreeSet::new(),
    }
  }

  /// Marks a reconcile as in flight.
  pub fn pending(previous: &SyncStatus) -> Self {
    Self {
      state: SyncState::Pending,
      failed_step: None,
      message: None,
      ..previous.clone()
    }
  }

  /// Keeps the last good fingerprint so a later resync can tell what the
  /// gateway held before the failure.
  pub fn failed(previous: &SyncStatus, step: SyncStep, message: String) -> Self {
    Self {
      state: SyncState::Failed,
      failed_step: Some(step),
      message: Some(message),
      fingerprint: previous.fingerprint.clone(),
      synced_at: previous.synced_at,
      retired_names: previous.retired_names.clone(),
    }
  }

  pub fn needs_sync(&self) -> bool {
    self.state != SyncState::Synced || !self.retired_names.is_empty()
  }
}
