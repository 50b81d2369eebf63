//! Access keys and the request-authentication layer.
//!
//! The key string itself is the caller scope: once [`require_api_key`] has
//! accepted a request, handlers read the scope from the [`CallerScope`]
//! extension and pass it explicitly into every core call.

use anyhow::Result;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::{self, SharedConnection};
use crate::error::RelayError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKey {
    pub id: String,
    pub label: String,
    pub is_active: bool,
    pub created_at: String,
}

/// A fresh random key, `kt_` followed by 32 hex digits.
pub fn generate_key() -> String {
    format!("kt_{}", uuid::Uuid::new_v4().simple())
}

/// Shorten a key for logs and listings.
pub fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(6).collect();
    if prefix.len() == key.len() {
        "***".to_string()
    } else {
        format!("{prefix}…")
    }
}

/// Store `key` as an active key.
pub fn insert_key(conn: &Connection, key: &str, label: &str) -> Result<AccessKey> {
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO access_keys (id, label, is_active, created_at) VALUES (?1, ?2, 1, ?3)",
        params![key, label, created_at],
    )?;
    Ok(AccessKey {
        id: key.to_string(),
        label: label.to_string(),
        is_active: true,
        created_at,
    })
}

/// Generate and store a new active key.
pub fn create_key(conn: &Connection, label: &str) -> Result<AccessKey> {
    let key = insert_key(conn, &generate_key(), label)?;
    tracing::info!(key = %redact(&key.id), label = %label, "access key created");
    Ok(key)
}

pub fn list_keys(conn: &Connection) -> Result<Vec<AccessKey>> {
    let mut stmt = conn.prepare(
        "SELECT id, label, is_active, created_at FROM access_keys ORDER BY created_at, id",
    )?;
    let keys = stmt
        .query_map([], |row| {
            Ok(AccessKey {
                id: row.get(0)?,
                label: row.get(1)?,
                is_active: row.get::<_, i64>(2)? != 0,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

/// Returns whether a key with this id existed.
pub fn deactivate_key(conn: &Connection, key: &str) -> Result<bool> {
    let changed = conn.execute("UPDATE access_keys SET is_active = 0 WHERE id = ?1", params![key])?;
    Ok(changed == 1)
}

pub fn is_active(conn: &Connection, key: &str) -> Result<bool> {
    let active: Option<i64> = conn
        .query_row(
            "SELECT is_active FROM access_keys WHERE id = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(active == Some(1))
}

/// Insert the configured initial key when no keys exist yet.
pub fn seed_initial_key(conn: &Connection, key: Option<&str>) -> Result<bool> {
    let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(false);
    };
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM access_keys", [], |row| row.get(0))?;
    if existing > 0 {
        return Ok(false);
    }
    insert_key(conn, key, "initial")?;
    tracing::info!(key = %redact(key), "seeded initial access key");
    Ok(true)
}

/// The authenticated caller's scope, inserted by [`require_api_key`].
#[derive(Debug, Clone)]
pub struct CallerScope(pub String);

/// State for [`require_api_key`].
#[derive(Clone)]
pub struct KeyGuard {
    pub db: SharedConnection,
    pub header: String,
}

/// Reject requests without an active key in the configured header.
pub async fn require_api_key(State(guard): State<KeyGuard>, mut request: Request, next: Next) -> Response {
    let key = request
        .headers()
        .get(guard.header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    let Some(key) = key else {
        return RelayError::Unauthorized("missing access key".into()).into_response();
    };

    let lookup = key.clone();
    match db::run_blocking(&guard.db, move |conn| is_active(conn, &lookup)).await {
        Ok(true) => {
            request.extensions_mut().insert(CallerScope(key));
            next.run(request).await
        }
        Ok(false) => {
            tracing::warn!(key = %redact(&key), "rejected unknown or inactive access key");
            RelayError::Unauthorized("invalid or inactive access key".into()).into_response()
        }
        Err(e) => RelayError::Storage(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_keys_are_active_until_deactivated() {
        let conn = db::open_memory_database().unwrap();
        let key = create_key(&conn, "phone").unwrap();
        assert!(key.id.starts_with("kt_"));
        assert!(is_active(&conn, &key.id).unwrap());

        assert!(deactivate_key(&conn, &key.id).unwrap());
        assert!(!is_active(&conn, &key.id).unwrap());
        assert!(!deactivate_key(&conn, "kt_missing").unwrap());
    }

    #[test]
    fn unknown_keys_are_inactive() {
        let conn = db::open_memory_database().unwrap();
        assert!(!is_active(&conn, "nope").unwrap());
    }

    #[test]
    fn seeding_only_happens_on_empty_table() {
        let conn = db::open_memory_database().unwrap();
        assert!(!seed_initial_key(&conn, None).unwrap());
        assert!(!seed_initial_key(&conn, Some("  ")).unwrap());
        assert!(seed_initial_key(&conn, Some("first-key")).unwrap());
        assert!(!seed_initial_key(&conn, Some("second-key")).unwrap());

        let keys = list_keys(&conn).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "first-key");
        assert_eq!(keys[0].label, "initial");
    }

    #[test]
    fn redaction_hides_the_tail() {
        assert_eq!(redact("kt_0123456789"), "kt_012…");
        assert_eq!(redact("short"), "***");
    }
}
