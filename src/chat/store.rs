//! Conversation Store: session creation, scoped reads, message append and the
//! one-shot title derivation.
//!
//! Every read and write filters on both `scope` and `id`; a session id from
//! another scope behaves exactly like a missing one.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use super::types::{truncate_title, Message, Role, Session, SessionSummary};

/// Create an empty session with a timestamped placeholder title.
pub fn create_session(conn: &Connection, scope: &str) -> Result<Session> {
    let now = chrono::Utc::now();
    let id = uuid::Uuid::now_v7().to_string();
    let title = format!("Session {}", now.format("%Y-%m-%d %H:%M"));
    let now = now.to_rfc3339();

    conn.execute(
        "INSERT INTO chat_sessions (id, scope, title, title_derived, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![id, scope, title, now],
    )?;

    tracing::debug!(scope = %crate::auth::redact(scope), session = %id, "session created");

    Ok(Session {
        id,
        scope: scope.to_string(),
        title,
        created_at: now.clone(),
        updated_at: now,
        messages: Vec::new(),
    })
}

/// Load a session and its messages. `None` when absent or owned by another scope.
pub fn get_session(conn: &Connection, scope: &str, id: &str) -> Result<Option<Session>> {
    let header = conn
        .query_row(
            "SELECT id, scope, title, created_at, updated_at FROM chat_sessions \
             WHERE scope = ?1 AND id = ?2",
            params![scope, id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    scope: row.get(1)?,
                    title: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    messages: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut session) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT role, content, timestamp FROM chat_messages WHERE session_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![session.id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    for row in rows {
        let (role, content, timestamp) = row?;
        let role: Role = role.parse().map_err(anyhow::Error::msg)?;
        session.messages.push(Message {
            role,
            content,
            timestamp,
        });
    }

    Ok(Some(session))
}

/// Session summaries for a scope, most recently updated first.
pub fn list_sessions(conn: &Connection, scope: &str) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.title, s.created_at, s.updated_at, \
                (SELECT COUNT(*) FROM chat_messages m WHERE m.session_id = s.id) \
         FROM chat_sessions s \
         WHERE s.scope = ?1 \
         ORDER BY s.updated_at DESC, s.id DESC",
    )?;

    let summaries = stmt
        .query_map(params![scope], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                message_count: row.get::<_, i64>(4)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(summaries)
}

/// Append a message and bump the session's `updated_at`.
///
/// Returns `false` (and writes nothing) if the session is not in `scope`.
pub fn append_message(
    conn: &mut Connection,
    scope: &str,
    session_id: &str,
    message: &Message,
) -> Result<bool> {
    let tx = conn.transaction()?;

    let touched = tx.execute(
        "UPDATE chat_sessions SET updated_at = ?1 WHERE scope = ?2 AND id = ?3",
        params![message.timestamp, scope, session_id],
    )?;
    if touched == 0 {
        return Ok(false);
    }

    tx.execute(
        "INSERT INTO chat_messages (session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![
            session_id,
            message.role.as_str(),
            message.content,
            message.timestamp
        ],
    )?;

    tx.commit()?;
    Ok(true)
}

/// Replace the placeholder title with one derived from `text`, at most once.
///
/// The `title_derived` guard makes this a compare-and-set: when two first
/// messages race on a brand-new session, exactly one derivation lands.
/// Returns whether this call set the title.
pub fn set_title_once(conn: &Connection, scope: &str, session_id: &str, text: &str) -> Result<bool> {
    let title = truncate_title(text);
    let changed = conn.execute(
        "UPDATE chat_sessions SET title = ?1, title_derived = 1 \
         WHERE scope = ?2 AND id = ?3 AND title_derived = 0",
        params![title, scope, session_id],
    )?;
    Ok(changed == 1)
}
