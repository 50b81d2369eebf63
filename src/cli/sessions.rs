//! CLI `sessions` command.

use anyhow::Result;

use kotoba::chat::store;
use kotoba::config::KotobaConfig;

pub fn list(config: &KotobaConfig, scope: &str) -> Result<()> {
    let conn = super::open_db(config)?;
    let sessions = store::list_sessions(&conn, scope)?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    for session in &sessions {
        println!(
            "{}  {:>3} msg  {}  {}",
            session.id, session.message_count, session.updated_at, session.title
        );
    }
    Ok(())
}
