//! SQL DDL for all kotoba tables.
//!
//! Defines `access_keys`, `chat_sessions`, `chat_messages`, `vocabulary_units`
//! and `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for kotoba's core tables.
const SCHEMA_SQL: &str = r#"
-- Caller credentials; the key itself is the caller scope
CREATE TABLE IF NOT EXISTS access_keys (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 1 CHECK(is_active IN (0, 1)),
    created_at TEXT NOT NULL
);

-- Conversation sessions
CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    title TEXT NOT NULL,
    title_derived INTEGER NOT NULL DEFAULT 0 CHECK(title_derived IN (0, 1)),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_scope_updated ON chat_sessions(scope, updated_at DESC);

-- Append-only message log; rowid order is conversation order
CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages(session_id, id);

-- Vocabulary index; (scope, unit) is the natural key
CREATE TABLE IF NOT EXISTS vocabulary_units (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    unit TEXT NOT NULL,
    readings TEXT NOT NULL DEFAULT '[]',
    meanings TEXT NOT NULL DEFAULT '[]',
    level TEXT CHECK(level IS NULL OR level IN ('N1','N2','N3','N4','N5')),
    occurrence_count INTEGER NOT NULL DEFAULT 1 CHECK(occurrence_count >= 1),
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    UNIQUE(scope, unit)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
