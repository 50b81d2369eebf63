//! CLI `key` commands: create, list and deactivate access keys.

use anyhow::{bail, Result};

use kotoba::auth;
use kotoba::config::KotobaConfig;

pub fn create(config: &KotobaConfig, label: &str) -> Result<()> {
    let conn = super::open_db(config)?;
    let key = auth::create_key(&conn, label)?;

    println!("Created access key for \"{}\":", key.label);
    println!();
    println!("  {}", key.id);
    println!();
    println!("Send it in the {} header. It cannot be shown again in full.", config.auth.header);
    Ok(())
}

pub fn list(config: &KotobaConfig) -> Result<()> {
    let conn = super::open_db(config)?;
    let keys = auth::list_keys(&conn)?;

    if keys.is_empty() {
        println!("No access keys. Create one with `kotoba key create <label>`.");
        return Ok(());
    }

    println!("{:<12} {:<8} {:<26} LABEL", "KEY", "STATUS", "CREATED");
    for key in &keys {
        let status = if key.is_active { "active" } else { "inactive" };
        println!(
            "{:<12} {:<8} {:<26} {}",
            auth::redact(&key.id),
            status,
            key.created_at,
            key.label
        );
    }
    Ok(())
}

pub fn deactivate(config: &KotobaConfig, key: &str) -> Result<()> {
    let conn = super::open_db(config)?;
    if !auth::deactivate_key(&conn, key)? {
        bail!("no access key {}", auth::redact(key));
    }
    println!("Deactivated {}", auth::redact(key));
    Ok(())
}
