use crate::output::print_json;
use actions_core::migrations::CURRENT_SCHEMA_VERSION;
use anyhow::Result;

pub fn run(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    if json {
        return print_json(&serde_json::json!({
            "version": version,
            "schema_version": CURRENT_SCHEMA_VERSION,
        }));
    }
    println!("action-server {version} (run schema v{CURRENT_SCHEMA_VERSION})");
    Ok(())
}
