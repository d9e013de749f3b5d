use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ActionsError, Result};

pub const DATADIR_ENV: &str = "ACTION_SERVER_DATADIR";
pub const DEFAULT_DATADIR: &str = ".action-server";
pub const DB_FILE: &str = "runs.redb";
pub const MANIFEST_FILE: &str = "action-manifest.yaml";

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub datadir: PathBuf,
    pub manifest: PathBuf,
    /// When set, `/api/*` requires `Authorization: Bearer <api_key>`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Upper bound on concurrently executing action bodies.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    /// Timeout applied when neither the request nor the action sets one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// When non-empty, only these action ids are exposed.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_processes() -> usize {
    20
}

fn default_timeout_secs() -> u64 {
    300
}

impl ServerConfig {
    pub fn new(datadir: impl Into<PathBuf>, manifest: impl Into<PathBuf>) -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            datadir: datadir.into(),
            manifest: manifest.into(),
            api_key: None,
            max_processes: default_max_processes(),
            default_timeout_secs: default_timeout_secs(),
            whitelist: Vec::new(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        db_path(&self.datadir)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_processes == 0 {
            return Err(ActionsError::InvalidConfig(
                "max_processes must be at least 1".into(),
            ));
        }
        if self.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(ActionsError::InvalidConfig("api key is empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn db_path(datadir: &Path) -> PathBuf {
    datadir.join(DB_FILE)
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `--datadir` flag / `ACTION_SERVER_DATADIR` env var (passed in as `explicit`)
/// 2. `~/.action-server`
pub fn resolve_datadir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    let home = home::home_dir().ok_or(ActionsError::HomeNotFound)?;
    Ok(home.join(DEFAULT_DATADIR))
}

/// Split a comma-separated whitelist (`"a, b,,c"` → `["a", "b", "c"]`).
pub fn parse_whitelist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
