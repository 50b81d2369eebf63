//! Vocabulary Index Store: idempotent per-scope counters with first-write-wins
//! metadata.
//!
//! [`upsert_unit`] is a single `INSERT … ON CONFLICT DO UPDATE` statement, so
//! the `(scope, unit)` uniqueness constraint decides insert vs. update inside
//! the engine: a racing second insert becomes an update, never a conflict
//! error, and the counter increment cannot be lost.

use anyhow::{Context, Result};
use futures::future::join_all;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{ExtractedUnit, JlptLevel, Unit, UnitMetadata, VocabularyUnit};
use crate::auth::redact;
use crate::db::{self, SharedConnection};

const UPSERT_SQL: &str = "\
INSERT INTO vocabulary_units \
    (id, scope, unit, readings, meanings, level, occurrence_count, first_seen_at, last_seen_at) \
VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7) \
ON CONFLICT(scope, unit) DO UPDATE SET \
    occurrence_count = occurrence_count + 1, \
    last_seen_at = excluded.last_seen_at, \
    readings = CASE WHEN json_array_length(readings) = 0 THEN excluded.readings ELSE readings END, \
    meanings = CASE WHEN json_array_length(meanings) = 0 THEN excluded.meanings ELSE meanings END, \
    level = COALESCE(level, excluded.level) \
RETURNING occurrence_count";

const SELECT_COLUMNS: &str = "id, scope, unit, readings, meanings, level, occurrence_count, \
                              first_seen_at, last_seen_at";

/// Record one observation of `unit` under `scope`. Returns the new occurrence count.
pub fn upsert_unit(
    conn: &Connection,
    scope: &str,
    unit: &Unit,
    metadata: &UnitMetadata,
) -> Result<u64> {
    let now = chrono::Utc::now().to_rfc3339();
    let readings = serde_json::to_string(&metadata.readings)?;
    let meanings = serde_json::to_string(&metadata.meanings)?;
    let level = metadata.level.map(|l| l.as_str());

    let count: i64 = conn
        .query_row(
            UPSERT_SQL,
            params![
                uuid::Uuid::now_v7().to_string(),
                scope,
                unit.as_str(),
                readings,
                meanings,
                level,
                now,
            ],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to upsert vocabulary unit {unit}"))?;

    tracing::trace!(scope = %redact(scope), unit = %unit, count, "vocabulary unit observed");
    Ok(count as u64)
}

/// Fetch one record by its natural key.
pub fn get_unit(conn: &Connection, scope: &str, unit: &Unit) -> Result<Option<VocabularyUnit>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM vocabulary_units WHERE scope = ?1 AND unit = ?2");
    let found = conn
        .query_row(&sql, params![scope, unit.as_str()], row_to_unit)
        .optional()?;
    Ok(found)
}

/// All units for a scope, most frequently observed first.
pub fn list_units(conn: &Connection, scope: &str) -> Result<Vec<VocabularyUnit>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM vocabulary_units WHERE scope = ?1 \
         ORDER BY occurrence_count DESC, first_seen_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let units = stmt
        .query_map(params![scope], row_to_unit)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(units)
}

/// Units in `scope` whose character equals `query`, whose level equals it
/// case-insensitively, or with a reading or meaning containing it
/// case-insensitively. Ordered like [`list_units`].
///
/// Blank queries are rejected by the caller, not here.
pub fn search_units(conn: &Connection, scope: &str, query: &str) -> Result<Vec<VocabularyUnit>> {
    let query = query.trim();
    let needle = query.to_lowercase();

    // Substring matching runs in Rust: SQLite's lower() only folds ASCII.
    let units = list_units(conn, scope)?
        .into_iter()
        .filter(|unit| unit_matches(unit, query, &needle))
        .collect();
    Ok(units)
}

fn unit_matches(unit: &VocabularyUnit, query: &str, needle: &str) -> bool {
    if unit.unit.as_str() == query {
        return true;
    }
    if unit
        .level
        .is_some_and(|level| level.as_str().eq_ignore_ascii_case(query))
    {
        return true;
    }
    unit.meanings
        .iter()
        .chain(unit.readings.iter())
        .any(|entry| entry.to_lowercase().contains(needle))
}

/// Summary of one [`upsert_batch`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub upserted: usize,
    pub failed: usize,
}

/// Upsert every extracted unit, one blocking task per unit, all in flight at once.
///
/// The tasks share `db`, so on one connection they take the lock in turn; each
/// upsert is still a single atomic statement and no unit waits on another
/// unit's result, only on the lock. Writers on separate connections (other
/// processes, other relays on the same file) interleave under SQLite's write
/// lock and busy timeout.
///
/// Failures are logged and counted; one bad unit does not stop the others.
pub async fn upsert_batch(
    db: &SharedConnection,
    scope: &str,
    units: Vec<ExtractedUnit>,
) -> BatchReport {
    let tasks = units.into_iter().map(|extracted| {
        let scope = scope.to_string();
        async move {
            let unit = extracted.unit.clone();
            let result = db::run_blocking(db, move |conn| {
                upsert_unit(conn, &scope, &extracted.unit, &extracted.metadata)
            })
            .await;
            (unit, result)
        }
    });

    let mut report = BatchReport::default();
    for (unit, result) in join_all(tasks).await {
        match result {
            Ok(_) => report.upserted += 1,
            Err(e) => {
                report.failed += 1;
                tracing::error!(scope = %redact(scope), unit = %unit, error = %e, "vocabulary upsert failed");
            }
        }
    }
    report
}

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<VocabularyUnit> {
    let unit: String = row.get(2)?;
    let unit = Unit::new(&unit).map_err(|e| conversion_error(2, e))?;

    let level: Option<String> = row.get(5)?;
    let level = level
        .map(|l| l.parse::<JlptLevel>())
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    Ok(VocabularyUnit {
        id: row.get(0)?,
        scope: row.get(1)?,
        unit,
        readings: json_list(row, 3)?,
        meanings: json_list(row, 4)?,
        level,
        occurrence_count: row.get::<_, i64>(6)? as u64,
        first_seen_at: row.get(7)?,
        last_seen_at: row.get(8)?,
    })
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}
