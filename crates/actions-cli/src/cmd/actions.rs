use crate::output::{print_json, print_table};
use actions_core::action::{ActionRegistry, ParamKind};
use actions_core::config::MANIFEST_FILE;
use actions_core::manifest::Manifest;
use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum ActionsSubcommand {
    /// List the actions a manifest exposes
    List {
        #[arg(long, default_value = MANIFEST_FILE)]
        manifest: PathBuf,
        /// Also verify every command can be found
        #[arg(long)]
        check: bool,
    },
}

pub fn run(subcommand: ActionsSubcommand, json: bool) -> Result<()> {
    match subcommand {
        ActionsSubcommand::List { manifest, check } => list(&manifest, check, json),
    }
}

fn list(path: &std::path::Path, check: bool, json: bool) -> Result<()> {
    let manifest =
        Manifest::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    if check {
        manifest.check_commands()?;
    }
    let actions = manifest.list();

    if json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("No actions.");
        return Ok(());
    }

    let rows = actions
        .iter()
        .map(|sig| {
            let params = sig
                .parameters
                .iter()
                .map(|p| match p.kind {
                    ParamKind::Plain => p.name.clone(),
                    ParamKind::Secret => format!("{} (secret)", p.name),
                    ParamKind::Context => format!("{} (context)", p.name),
                })
                .collect::<Vec<_>>()
                .join(", ");
            vec![sig.id.clone(), params, sig.description.clone()]
        })
        .collect();
    print_table(&["ID", "PARAMETERS", "DESCRIPTION"], rows);
    Ok(())
}
