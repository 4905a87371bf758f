//! Database schema and migrations for rssagg.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded; the schema_version table records which have run.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: Source catalog
    r#"
CREATE TABLE sources (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    url             TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    last_fetched_at TEXT,                  -- RFC 3339 UTC, NULL = never attempted
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_sources_due ON sources(last_fetched_at, id);
"#,
    // v2: Ingested items, keyed by link
    r#"
CREATE TABLE items (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id     INTEGER NOT NULL REFERENCES sources(id),
    link          TEXT NOT NULL UNIQUE,
    title         TEXT NOT NULL DEFAULT '',
    description   TEXT NOT NULL DEFAULT '',
    published_at  TEXT NOT NULL,
    discovered_at TEXT NOT NULL
);

CREATE INDEX idx_items_source ON items(source_id, published_at DESC);
"#,
];
