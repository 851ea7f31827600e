//! SQLite-backed catalog store.
//!
//! The store is the source of truth for entries, policies and products. Every
//! write runs in a transaction that also bumps the catalog revision, which the
//! cache uses to reject values read before the write.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::gateway::SyncStep;

use super::schema::SCHEMA;
use super::types::{ApiEntry, ApiProduct, Policy, ProductRef, SyncState, SyncStatus};

const ENTRY_COLUMNS: &str = "id, name, route, upstream_url, methods, hosts, tags, enabled, \
  version, created_at, updated_at, sync_state, sync_step, sync_message, sync_fingerprint, \
  synced_at, sync_retired";

/// How long a write waits for another process holding the catalog lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Catalog database connection wrapper
pub struct CatalogStore {
  conn: Mutex<Connection>,
}

impl CatalogStore {
  /// Open or create the catalog at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create catalog directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open catalog at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| eyre!("Failed to configure catalog: {}", e))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory catalog: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run catalog migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Current catalog revision.
  pub fn revision(&self) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM catalog_meta WHERE key = 'revision'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read catalog revision: {}", e))
  }

  // ==========================================================================
  // Entries
  // ==========================================================================

  pub fn insert_entry(&self, entry: &ApiEntry, product_id: Option<Uuid>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      &format!(
        "INSERT INTO apis ({ENTRY_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
      ),
      params![
        entry.id.to_string(),
        entry.name,
        entry.route,
        entry.upstream_url,
        encode_set(&entry.methods)?,
        encode_set(&entry.hosts)?,
        encode_set(&entry.tags)?,
        entry.enabled,
        entry.version,
        entry.created_at.to_rfc3339(),
        entry.updated_at.to_rfc3339(),
        entry.sync.state.as_str(),
        entry.sync.failed_step.map(|s| s.to_string()),
        entry.sync.message,
        entry.sync.fingerprint,
        entry.sync.synced_at.map(|t| t.to_rfc3339()),
        encode_set(&entry.sync.retired_names)?,
      ],
    )
    .map_err(|e| eyre!("Failed to insert api {}: {}", entry.name, e))?;

    write_policies(&tx, entry.id, &entry.policies)?;
    if let Some(product_id) = product_id {
      replace_product_link(&tx, entry.id, product_id)?;
    }
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  /// Persist the entry's editable fields together with the names it no
  /// longer answers to. `product_id`, when given, becomes the entry's only
  /// product.
  pub fn update_entry(&self, entry: &ApiEntry, product_id: Option<Uuid>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE apis SET name = ?2, route = ?3, upstream_url = ?4, methods = ?5, hosts = ?6,
         tags = ?7, enabled = ?8, version = ?9, updated_at = ?10, sync_retired = ?11
       WHERE id = ?1",
      params![
        entry.id.to_string(),
        entry.name,
        entry.route,
        entry.upstream_url,
        encode_set(&entry.methods)?,
        encode_set(&entry.hosts)?,
        encode_set(&entry.tags)?,
        entry.enabled,
        entry.version,
        entry.updated_at.to_rfc3339(),
        encode_set(&entry.sync.retired_names)?,
      ],
    )
    .map_err(|e| eyre!("Failed to update api {}: {}", entry.name, e))?;

    if let Some(product_id) = product_id {
      replace_product_link(&tx, entry.id, product_id)?;
    }
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  /// Replace the entry's policies and record its new version.
  pub fn replace_policies(&self, entry: &ApiEntry) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE apis SET version = ?2, updated_at = ?3 WHERE id = ?1",
      params![
        entry.id.to_string(),
        entry.version,
        entry.updated_at.to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to update api {}: {}", entry.name, e))?;

    tx.execute(
      "DELETE FROM policies WHERE api_id = ?1",
      params![entry.id.to_string()],
    )
    .map_err(|e| eyre!("Failed to delete old policies: {}", e))?;
    write_policies(&tx, entry.id, &entry.policies)?;
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  pub fn set_sync_status(&self, id: Uuid, status: &SyncStatus) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE apis SET sync_state = ?2, sync_step = ?3, sync_message = ?4,
         sync_fingerprint = ?5, synced_at = ?6, sync_retired = ?7
       WHERE id = ?1",
      params![
        id.to_string(),
        status.state.as_str(),
        status.failed_step.map(|s| s.to_string()),
        status.message,
        status.fingerprint,
        status.synced_at.map(|t| t.to_rfc3339()),
        encode_set(&status.retired_names)?,
      ],
    )
    .map_err(|e| eyre!("Failed to record sync status for {}: {}", id, e))?;
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  /// Delete the entry with its policies and product links.
  pub fn delete_entry(&self, id: Uuid) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let deleted = tx
      .execute("DELETE FROM apis WHERE id = ?1", params![id.to_string()])
      .map_err(|e| eyre!("Failed to delete api {}: {}", id, e))?;
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted > 0)
  }

  pub fn get_entry(&self, id: Uuid) -> Result<Option<ApiEntry>> {
    let conn = self.lock()?;
    let mut entries = query_entries(&conn, "WHERE id = ?1", params![id.to_string()])?;
    Ok(entries.pop())
  }

  pub fn find_entry_by_name(&self, name: &str) -> Result<Option<ApiEntry>> {
    let conn = self.lock()?;
    let mut entries = query_entries(&conn, "WHERE name = ?1", params![name])?;
    Ok(entries.pop())
  }

  /// All entries, ordered by name.
  pub fn list_entries(&self) -> Result<Vec<ApiEntry>> {
    let conn = self.lock()?;
    query_entries(&conn, "", [])
  }

  // ==========================================================================
  // Products
  // ==========================================================================

  pub fn insert_product(&self, product: &ApiProduct) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO products (id, name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          product.id.to_string(),
          product.name,
          product.description,
          product.created_at.to_rfc3339(),
          product.updated_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to insert product {}: {}", product.name, e))?;
    Ok(())
  }

  pub fn update_product(&self, product: &ApiProduct) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE products SET name = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
      params![
        product.id.to_string(),
        product.name,
        product.description,
        product.updated_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to update product {}: {}", product.id, e))?;
    // Entry views embed product names
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  /// Delete the product and its entry links; the entries stay.
  pub fn delete_product(&self, id: Uuid) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let deleted = tx
      .execute("DELETE FROM products WHERE id = ?1", params![id.to_string()])
      .map_err(|e| eyre!("Failed to delete product {}: {}", id, e))?;
    bump_revision(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted > 0)
  }

  pub fn get_product(&self, id: Uuid) -> Result<Option<ApiProduct>> {
    let conn = self.lock()?;
    let mut products = query_products(&conn, "WHERE p.id = ?1", params![id.to_string()])?;
    Ok(products.pop())
  }

  pub fn list_products(&self) -> Result<Vec<ApiProduct>> {
    let conn = self.lock()?;
    query_products(&conn, "", [])
  }

  /// Add the entry to the product. Returns false if it was already there.
  pub fn link_product(&self, product_id: Uuid, api_id: Uuid) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let inserted = tx
      .execute(
        "INSERT OR IGNORE INTO product_apis (product_id, api_id, added_at) VALUES (?1, ?2, ?3)",
        params![
          product_id.to_string(),
          api_id.to_string(),
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to link api {} to product {}: {}", api_id, product_id, e))?;
    if inserted > 0 {
      bump_revision(&tx)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(inserted > 0)
  }

  /// Remove the entry from the product. Returns false if it was not there.
  pub fn unlink_product(&self, product_id: Uuid, api_id: Uuid) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let deleted = tx
      .execute(
        "DELETE FROM product_apis WHERE product_id = ?1 AND api_id = ?2",
        params![product_id.to_string(), api_id.to_string()],
      )
      .map_err(|e| eyre!("Failed to unlink api {} from product {}: {}", api_id, product_id, e))?;
    if deleted > 0 {
      bump_revision(&tx)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted > 0)
  }

  /// Ids of the entries in the product.
  pub fn product_entry_ids(&self, product_id: Uuid) -> Result<Vec<Uuid>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT api_id FROM product_apis WHERE product_id = ?1")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let ids: Vec<String> = stmt
      .query_map(params![product_id.to_string()], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query product apis: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read product apis: {}", e))?;

    ids.iter().map(|id| parse_uuid(id)).collect()
  }

  pub fn list_product_entries(&self, product_id: Uuid) -> Result<Vec<ApiEntry>> {
    let conn = self.lock()?;
    query_entries(
      &conn,
      "WHERE id IN (SELECT api_id FROM product_apis WHERE product_id = ?1)",
      params![product_id.to_string()],
    )
  }
}

// ============================================================================
// Row helpers
// ============================================================================

struct EntryRow {
  id: String,
  name: String,
  route: String,
  upstream_url: String,
  methods: String,
  hosts: String,
  tags: String,
  enabled: bool,
  version: i64,
  created_at: String,
  updated_at: String,
  sync_state: String,
  sync_step: Option<String>,
  sync_message: Option<String>,
  sync_fingerprint: Option<String>,
  synced_at: Option<String>,
  sync_retired: String,
}

impl EntryRow {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      name: row.get(1)?,
      route: row.get(2)?,
      upstream_url: row.get(3)?,
      methods: row.get(4)?,
      hosts: row.get(5)?,
      tags: row.get(6)?,
      enabled: row.get(7)?,
      version: row.get(8)?,
      created_at: row.get(9)?,
      updated_at: row.get(10)?,
      sync_state: row.get(11)?,
      sync_step: row.get(12)?,
      sync_message: row.get(13)?,
      sync_fingerprint: row.get(14)?,
      synced_at: row.get(15)?,
      sync_retired: row.get(16)?,
    })
  }

  fn into_entry(self) -> Result<ApiEntry> {
    let state = SyncState::parse(&self.sync_state)
      .ok_or_else(|| eyre!("Unknown sync state '{}'", self.sync_state))?;
    let failed_step = self
      .sync_step
      .map(|s| {
        serde_json::from_value::<SyncStep>(serde_json::Value::String(s.clone()))
          .map_err(|_| eyre!("Unknown sync step '{}'", s))
      })
      .transpose()?;

    Ok(ApiEntry {
      id: parse_uuid(&self.id)?,
      name: self.name,
      route: self.route,
      upstream_url: self.upstream_url,
      methods: decode_set(&self.methods)?,
      hosts: decode_set(&self.hosts)?,
      tags: decode_set(&self.tags)?,
      enabled: self.enabled,
      policies: Vec::new(),
      products: Vec::new(),
      version: self.version,
      created_at: parse_timestamp(&self.created_at)?,
      updated_at: parse_timestamp(&self.updated_at)?,
      sync: SyncStatus {
        state,
        failed_step,
        message: self.sync_message,
        fingerprint: self.sync_fingerprint,
        synced_at: self.synced_at.as_deref().map(parse_timestamp).transpose()?,
        retired_names: decode_set(&self.sync_retired)?,
      },
    })
  }
}

fn query_entries<P: rusqlite::Params>(
  conn: &Connection,
  filter: &str,
  params: P,
) -> Result<Vec<ApiEntry>> {
  let sql = format!("SELECT {ENTRY_COLUMNS} FROM apis {filter} ORDER BY name");
  let mut stmt = conn
    .prepare(&sql)
    .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

  let rows: Vec<EntryRow> = stmt
    .query_map(params, EntryRow::read)
    .map_err(|e| eyre!("Failed to query entries: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read entries: {}", e))?;

  rows
    .into_iter()
    .map(|row| {
      let mut entry = row.into_entry()?;
      entry.policies = load_policies(conn, entry.id)?;
      entry.products = load_product_refs(conn, entry.id)?;
      Ok(entry)
    })
    .collect()
}

fn load_policies(conn: &Connection, api_id: Uuid) -> Result<Vec<Policy>> {
  let mut stmt = conn
    .prepare("SELECT id, type, configuration FROM policies WHERE api_id = ?1 ORDER BY position")
    .map_err(|e| eyre!("Failed to prepare policy query: {}", e))?;

  let rows: Vec<(String, String, String)> = stmt
    .query_map(params![api_id.to_string()], |row| {
      Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })
    .map_err(|e| eyre!("Failed to query policies: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read policies: {}", e))?;

  rows
    .into_iter()
    .map(|(id, kind, configuration)| {
      Ok(Policy {
        id: parse_uuid(&id)?,
        kind,
        configuration,
      })
    })
    .collect()
}

fn load_product_refs(conn: &Connection, api_id: Uuid) -> Result<Vec<ProductRef>> {
  let mut stmt = conn
    .prepare(
      "SELECT p.id, p.name FROM products p
       INNER JOIN product_apis pa ON pa.product_id = p.id
       WHERE pa.api_id = ?1
       ORDER BY pa.added_at, p.name",
    )
    .map_err(|e| eyre!("Failed to prepare product query: {}", e))?;

  let rows: Vec<(String, String)> = stmt
    .query_map(params![api_id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
    .map_err(|e| eyre!("Failed to query products: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read products: {}", e))?;

  rows
    .into_iter()
    .map(|(id, name)| {
      Ok(ProductRef {
        id: parse_uuid(&id)?,
        name,
      })
    })
    .collect()
}

fn query_products<P: rusqlite::Params>(
  conn: &Connection,
  filter: &str,
  params: P,
) -> Result<Vec<ApiProduct>> {
  let sql = format!(
    "SELECT p.id, p.name, p.description, p.created_at, p.updated_at,
       (SELECT COUNT(*) FROM product_apis pa WHERE pa.product_id = p.id)
     FROM products p {filter}
     ORDER BY p.name"
  );
  let mut stmt = conn
    .prepare(&sql)
    .map_err(|e| eyre!("Failed to prepare product query: {}", e))?;

  type ProductRow = (String, String, Option<String>, String, String, i64);
  let rows: Vec<ProductRow> = stmt
    .query_map(params, |row| {
      Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
      ))
    })
    .map_err(|e| eyre!("Failed to query products: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read products: {}", e))?;

  rows
    .into_iter()
    .map(|(id, name, description, created_at, updated_at, count)| {
      Ok(ApiProduct {
        id: parse_uuid(&id)?,
        name,
        description,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        api_count: usize::try_from(count).unwrap_or_default(),
      })
    })
    .collect()
}

fn write_policies(conn: &Connection, api_id: Uuid, policies: &[Policy]) -> Result<()> {
  for (position, policy) in policies.iter().enumerate() {
    conn
      .execute(
        "INSERT INTO policies (id, api_id, type, configuration, position)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          policy.id.to_string(),
          api_id.to_string(),
          policy.kind,
          policy.configuration,
          position as i64,
        ],
      )
      .map_err(|e| eyre!("Failed to store policy {}: {}", policy.kind, e))?;
  }
  Ok(())
}

fn replace_product_link(conn: &Connection, api_id: Uuid, product_id: Uuid) -> Result<()> {
  conn
    .execute(
      "DELETE FROM product_apis WHERE api_id = ?1",
      params![api_id.to_string()],
    )
    .map_err(|e| eyre!("Failed to clear product links: {}", e))?;
  conn
    .execute(
      "INSERT INTO product_apis (product_id, api_id, added_at) VALUES (?1, ?2, ?3)",
      params![
        product_id.to_string(),
        api_id.to_string(),
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to link product {}: {}", product_id, e))?;
  Ok(())
}

fn bump_revision(conn: &Connection) -> Result<()> {
  conn
    .execute(
      "UPDATE catalog_meta SET value = value + 1 WHERE key = 'revision'",
      [],
    )
    .map_err(|e| eyre!("Failed to bump catalog revision: {}", e))?;
  Ok(())
}

fn encode_set(set: &BTreeSet<String>) -> Result<String> {
  serde_json::to_string(set).map_err(|e| eyre!("Failed to serialize set: {}", e))
}

fn decode_set(s: &str) -> Result<BTreeSet<String>> {
  serde_json::from_str(s).map_err(|e| eyre!("Failed to parse stored set '{}': {}", s, e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
  Uuid::parse_str(s).map_err(|e| eyre!("Invalid stored id '{}': {}", s, e))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}
