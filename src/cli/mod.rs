pub mod doctor;
pub mod keys;
pub mod sessions;
pub mod vocab;

use anyhow::{Context, Result};
use rusqlite::Connection;

use kotoba::config::KotobaConfig;
use kotoba::db;

/// Open (and if needed create) the configured database.
fn open_db(config: &KotobaConfig) -> Result<Connection> {
    let db_path = config.resolved_db_path();
    db::open_database(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))
}
