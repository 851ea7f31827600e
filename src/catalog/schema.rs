/// Catalog tables. Applied on every open; statements are idempotent.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Catalog-wide write counter, bumped in every write transaction
CREATE TABLE IF NOT EXISTS catalog_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO catalog_meta (key, value) VALUES ('revision', 0);

CREATE TABLE IF NOT EXISTS apis (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    route TEXT NOT NULL,
    upstream_url TEXT NOT NULL,
    methods TEXT NOT NULL,
    hosts TEXT NOT NULL,
    tags TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    sync_state TEXT NOT NULL DEFAULT 'pending',
    sync_step TEXT,
    sync_message TEXT,
    sync_fingerprint TEXT,
    synced_at TEXT,
    -- JSON array of former names still holding gateway resources
    sync_retired TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS policies (
    id TEXT PRIMARY KEY,
    api_id TEXT NOT NULL REFERENCES apis(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    configuration TEXT NOT NULL,
    position INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_policies_api ON policies(api_id);

CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS product_apis (
    product_id TEXT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
    api_id TEXT NOT NULL REFERENCES apis(id) ON DELETE CASCADE,
    added_at TEXT NOT NULL,
    PRIMARY KEY (product_id, api_id)
);

CREATE INDEX IF NOT EXISTS idx_product_apis_api ON product_apis(api_id);
"#;
