use crate::output::print_json;
use actions_core::keyring::{generate_key, KEYS_ENV};
use anyhow::Result;

pub fn run(json: bool) -> Result<()> {
    let key = generate_key();
    if json {
        return print_json(&serde_json::json!({ "key": key }));
    }
    println!("{key}");
    eprintln!("add it to {KEYS_ENV}, e.g. {KEYS_ENV}='[\"{key}\"]'");
    Ok(())
}
