//! CLI `vocab` commands: inspect one caller's vocabulary index.

use anyhow::{bail, Result};

use kotoba::config::KotobaConfig;
use kotoba::vocab::store;
use kotoba::vocab::types::VocabularyUnit;

pub fn list(config: &KotobaConfig, scope: &str) -> Result<()> {
    let conn = super::open_db(config)?;
    let units = store::list_units(&conn, scope)?;
    print_units(&units);
    Ok(())
}

pub fn search(config: &KotobaConfig, scope: &str, query: &str) -> Result<()> {
    if query.trim().is_empty() {
        bail!("search query must not be empty");
    }
    let conn = super::open_db(config)?;
    let units = store::search_units(&conn, scope, query)?;
    print_units(&units);
    Ok(())
}

fn print_units(units: &[VocabularyUnit]) {
    if units.is_empty() {
        println!("No vocabulary units.");
        return;
    }

    for unit in units {
        let level = unit.level.map_or("--", |l| l.as_str());
        println!(
            "{}  {:>4}x  {}  {}  [{}]",
            unit.unit,
            unit.occurrence_count,
            level,
            unit.meanings.join(", "),
            unit.readings.join(", ")
        );
    }
    println!();
    println!("{} unit(s)", units.len());
}
