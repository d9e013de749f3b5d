mod cmd;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use cmd::{actions::ActionsSubcommand, runs::RunsSubcommand, start::StartArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "action-server",
    about = "Run registered actions with encrypted per-invocation secrets",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data directory holding the run database (default: ~/.action-server)
    #[arg(long, global = true, env = "ACTION_SERVER_DATADIR")]
    datadir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log at debug level
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Start(StartArgs),

    /// Upgrade the run database to the current schema
    Migrate,

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        subcommand: RunsSubcommand,
    },

    /// Inspect the action manifest
    Actions {
        #[command(subcommand)]
        subcommand: ActionsSubcommand,
    },

    /// Print a new random decryption key (base64, 32 bytes)
    Keygen,

    /// Print version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => tracing::Level::DEBUG,
        (Commands::Start(_), false) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    let datadir = cli.datadir.as_deref();

    // Only the server keeps a log file; a bad datadir is reported by `start` itself.
    let log_dir = match &cli.command {
        Commands::Start(_) => actions_core::config::resolve_datadir(datadir).ok(),
        _ => None,
    };
    let log_guard = logging::init(default_level, log_dir.as_deref());

    let result = match cli.command {
        Commands::Start(args) => cmd::start::run(datadir, args),
        Commands::Migrate => cmd::migrate::run(datadir, cli.json),
        Commands::Runs { subcommand } => cmd::runs::run(datadir, subcommand, cli.json),
        Commands::Actions { subcommand } => cmd::actions::run(subcommand, cli.json),
        Commands::Keygen => cmd::keygen::run(cli.json),
        Commands::Version => cmd::version::run(cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        drop(log_guard);
        std::process::exit(1);
    }
}
