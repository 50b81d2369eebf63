//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use kotoba::config::KotobaConfig;
use kotoba::db;

/// Run database diagnostics and print a health report.
pub fn doctor(config: &KotobaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `kotoba serve` or `kotoba key create <label>` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path)
        .map(|m| m.len())
        .unwrap_or(0);

    let conn = db::open_database(&db_path)
        .context("failed to open database (may be corrupt)")?;

    let report = db::check_database_health(&conn)
        .context("failed to run health check")?;

    println!("Kotoba Health Report");
    println!("====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!();
    println!("Upstream:");
    println!("  Endpoint:        {}", config.upstream.endpoint);
    println!("  Model:           {}", config.upstream.model);
    if config.upstream.api_key.is_empty() {
        println!("  WARNING: no API key configured (set KOTOBA_UPSTREAM_KEY).");
    }
    println!();
    println!("Row counts:");
    println!("  Access keys:     {}", report.access_key_count);
    println!("  Sessions:        {}", report.session_count);
    println!("  Messages:        {}", report.message_count);
    println!("  Vocabulary:      {}", report.vocabulary_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop the server.");
        println!("  2. Restore from a backup: cp backup.db {}", db_path.display());
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
