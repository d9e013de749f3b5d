use crate::output::{print_json, print_table};
use actions_core::config::{db_path, resolve_datadir};
use actions_core::registry::{RunFilter, RunRegistry};
use actions_core::run::{ActionRun, RunState};
use anyhow::{anyhow, Result};
use clap::Subcommand;
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand, Debug)]
pub enum RunsSubcommand {
    /// List runs, newest first
    List {
        /// Only runs in this state (repeatable)
        #[arg(long)]
        state: Vec<RunState>,
        /// Only runs of this action
        #[arg(long)]
        action: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one run and its outputs
    Get { id: Uuid },
}

pub fn run(datadir: Option<&Path>, subcommand: RunsSubcommand, json: bool) -> Result<()> {
    let path = db_path(&resolve_datadir(datadir)?);
    if !path.exists() {
        return Err(anyhow!("no run database at {}", path.display()));
    }
    let registry = RunRegistry::open(&path)?;

    match subcommand {
        RunsSubcommand::List {
            state,
            action,
            limit,
        } => {
            let filter = RunFilter {
                states: state,
                action_id: action,
                limit: Some(limit),
                ..Default::default()
            };
            list(&registry, &filter, json)
        }
        RunsSubcommand::Get { id } => get(&registry, id, json),
    }
}

fn list(registry: &RunRegistry, filter: &RunFilter, json: bool) -> Result<()> {
    let runs = registry.list(filter)?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    let rows = runs.iter().map(row).collect();
    print_table(&["ID", "ACTION", "STATE", "CREATED", "ERROR"], rows);
    Ok(())
}

fn row(run: &ActionRun) -> Vec<String> {
    vec![
        run.id.to_string(),
        run.action_id.clone(),
        run.state.to_string(),
        run.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        run.error
            .as_ref()
            .map(|e| e.kind.to_string())
            .unwrap_or_default(),
    ]
}

fn get(registry: &RunRegistry, id: Uuid, json: bool) -> Result<()> {
    let run = registry.get(id)?;
    let outputs = match run.outputs_ref.as_deref() {
        Some(reference) => Some(registry.get_payload(reference)?),
        None => None,
    };

    if json {
        return print_json(&serde_json::json!({ "run": run, "outputs": outputs }));
    }

    println!("Run:      {}", run.id);
    println!("Action:   {}", run.action_id);
    println!("State:    {}", run.state);
    println!("Created:  {}", run.created_at.to_rfc3339());
    if let Some(started) = run.started_at {
        println!("Started:  {}", started.to_rfc3339());
    }
    if let Some(ended) = run.ended_at {
        println!("Ended:    {}", ended.to_rfc3339());
    }
    if let Some(index) = run.key_index {
        println!("Key:      #{index}");
    }
    if let Some(error) = &run.error {
        println!("Error:    {} ({})", error.message, error.kind);
    }
    if let Some(outputs) = outputs {
        println!("Outputs:\n{}", serde_json::to_string_pretty(&outputs)?);
    }
    Ok(())
}
