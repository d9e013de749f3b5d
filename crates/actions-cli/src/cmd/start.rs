use actions_core::config::{parse_whitelist, resolve_datadir, ServerConfig, MANIFEST_FILE};
use actions_core::registry::RunRegistry;
use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Address to bind
    #[arg(long, default_value = "localhost")]
    address: String,

    /// Port to listen on (0 = OS-assigned)
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Action manifest
    #[arg(long, default_value = MANIFEST_FILE)]
    manifest: PathBuf,

    /// Require `Authorization: Bearer <key>` on every API request
    #[arg(long, env = "ACTION_SERVER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Maximum concurrently running actions
    #[arg(long, default_value = "20")]
    max_processes: usize,

    /// Seconds before a run without its own timeout is failed
    #[arg(long, default_value = "300")]
    default_timeout: u64,

    /// Comma-separated action ids to expose (default: all)
    #[arg(long)]
    whitelist: Option<String>,
}

impl StartArgs {
    fn into_config(self, datadir: PathBuf) -> ServerConfig {
        let mut config = ServerConfig::new(datadir, self.manifest);
        config.address = self.address;
        config.port = self.port;
        config.api_key = self.api_key;
        config.max_processes = self.max_processes;
        config.default_timeout_secs = self.default_timeout;
        config.whitelist = self
            .whitelist
            .as_deref()
            .map(parse_whitelist)
            .unwrap_or_default();
        config
    }
}

pub fn run(datadir: Option<&Path>, args: StartArgs) -> Result<()> {
    let config = args.into_config(resolve_datadir(datadir)?);

    if RunRegistry::migration_pending(&config.db_path())? {
        bail!(
            "run database {} needs a migration; run 'action-server migrate' first",
            config.db_path().display()
        );
    }

    tracing::info!(
        datadir = %config.datadir.display(),
        manifest = %config.manifest.display(),
        max_processes = config.max_processes,
        auth = config.api_key.is_some(),
        "starting action server"
    );

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(actions_server::serve(&config))
}
