//! SQL migration definitions for the catalogsync status store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: documents keyed by id with status tracking",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per submitted product record.
-- Timestamps are RFC 3339 UTC with microseconds, so they order lexically.
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY,
    collection_type TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'NEW'
                    CHECK (status IN ('NEW', 'QUEUED', 'ERRORED', 'INDEXED')),
    error           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    vectors_json    TEXT
);

-- Fetcher claims and paged listings scan by status in creation order
CREATE INDEX IF NOT EXISTS idx_documents_status_created
    ON documents(status, created_at, id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index for per-collection status counts and time-range export",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_documents_status_collection
    ON documents(status, collection_type);

CREATE INDEX IF NOT EXISTS idx_documents_created
    ON documents(created_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
