use std::sync::Arc;

use actions_core::config::ServerConfig;
use actions_core::keyring::{KeyRing, KEYS_ENV};
use actions_core::manifest::Manifest;
use actions_core::registry::RunRegistry;
use actions_core::runner::ProcessInvoker;
use anyhow::Context;

use crate::dispatcher::Dispatcher;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    /// When set, `/api/*` requires a matching bearer token.
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, api_key: Option<String>) -> Self {
        Self {
            dispatcher,
            api_key: api_key.map(Arc::from),
        }
    }

    /// Load the manifest and key ring, open the run database and recover
    /// runs a previous process left unfinished.
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let manifest = Manifest::load(&config.manifest)
            .with_context(|| format!("failed to load {}", config.manifest.display()))?
            .with_whitelist(config.whitelist.clone());
        manifest.check_commands()?;
        let manifest = Arc::new(manifest);

        let keyring = KeyRing::from_env()?;
        if keyring.is_empty() {
            tracing::warn!("{KEYS_ENV} is not set; encrypted contexts will be rejected");
        } else {
            tracing::info!(keys = keyring.len(), "decryption keys loaded");
        }

        std::fs::create_dir_all(&config.datadir)
            .with_context(|| format!("failed to create {}", config.datadir.display()))?;
        let registry = RunRegistry::open(&config.db_path())?;
        let recovered = registry.startup_recovery(chrono::Utc::now())?;
        if recovered > 0 {
            tracing::warn!(recovered, "failed runs interrupted by a previous shutdown");
        }

        let dispatcher = Dispatcher::new(
            manifest.clone(),
            Arc::new(ProcessInvoker::new(manifest)),
            Arc::new(registry),
            Arc::new(keyring),
            config.max_processes,
            config.default_timeout(),
        );
        Ok(Self::new(dispatcher, config.api_key.clone()))
    }
}
