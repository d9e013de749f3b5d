use crate::output::print_json;
use actions_core::config::{db_path, resolve_datadir};
use actions_core::registry::RunRegistry;
use anyhow::{Context, Result};
use std::path::Path;

pub fn run(datadir: Option<&Path>, json: bool) -> Result<()> {
    let datadir = resolve_datadir(datadir)?;
    std::fs::create_dir_all(&datadir)
        .with_context(|| format!("failed to create {}", datadir.display()))?;
    let path = db_path(&datadir);

    let (from, to) = RunRegistry::migrate(&path)?;

    if json {
        return print_json(&serde_json::json!({
            "database": path,
            "from": from,
            "to": to,
        }));
    }
    if from == to {
        println!("Run database is up to date (schema v{to}).");
    } else {
        println!("Migrated run database from schema v{from} to v{to}.");
    }
    Ok(())
}
