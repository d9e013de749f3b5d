//! Action manifest: the file-backed action registry.
//!
//! ```yaml
//! actions:
//!   - id: send-report
//!     description: Email the weekly report
//!     command: ["python3", "send_report.py"]
//!     timeout_secs: 60
//!     env:
//!       SMTP_HOST: mail.internal
//!     parameters:
//!       - name: recipient
//!       - name: smtp_password
//!         kind: secret
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{ActionRegistry, ActionSignature};
use crate::error::{ActionsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestAction {
    #[serde(flatten)]
    pub signature: ActionSignature,
    /// argv; the first element is resolved on `PATH` unless it contains a `/`.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ManifestAction {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    actions: Vec<ManifestAction>,
}

/// Validated set of actions loaded from a manifest file.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Directory commands run in; relative command paths resolve against it.
    pub base_dir: PathBuf,
    actions: Vec<ManifestAction>,
    whitelist: Vec<String>,
}

/// Action ids become URL path segments: letters, digits, hyphens, underscores.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ActionsError::InvalidManifest(format!(
            "invalid action id '{id}': must contain only letters, digits, hyphens, and underscores"
        )));
    }
    Ok(())
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&content, base_dir)
    }

    pub fn from_yaml(content: &str, base_dir: PathBuf) -> Result<Self> {
        let file: ManifestFile = serde_yaml::from_str(content)?;
        let manifest = Self {
            base_dir,
            actions: file.actions,
            whitelist: Vec::new(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Restrict the exposed actions. An empty whitelist exposes everything.
    pub fn with_whitelist(mut self, whitelist: Vec<String>) -> Self {
        self.whitelist = whitelist;
        self
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for action in &self.actions {
            let id = &action.signature.id;
            validate_id(id)?;
            if !ids.insert(id.as_str()) {
                return Err(ActionsError::InvalidManifest(format!(
                    "duplicate action id '{id}'"
                )));
            }
            if action.command.is_empty() {
                return Err(ActionsError::InvalidManifest(format!(
                    "action '{id}' has an empty command"
                )));
            }
            let mut names = HashSet::new();
            for param in &action.signature.parameters {
                if !names.insert(param.name.as_str()) {
                    return Err(ActionsError::InvalidManifest(format!(
                        "action '{id}' declares parameter '{}' twice",
                        param.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn exposed(&self, id: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|w| w == id)
    }

    pub fn action(&self, id: &str) -> Option<&ManifestAction> {
        self.actions
            .iter()
            .find(|a| a.signature.id == id && self.exposed(id))
    }

    /// Resolve the program of `action` to an absolute path.
    pub fn program_path(&self, action: &ManifestAction) -> Result<PathBuf> {
        let program = &action.command[0];
        if program.contains('/') {
            let path = self.base_dir.join(program);
            if path.exists() {
                return Ok(path);
            }
        } else if let Ok(path) = which::which(program) {
            return Ok(path);
        }
        Err(ActionsError::CommandNotFound {
            action: action.signature.id.clone(),
            command: program.clone(),
        })
    }

    /// Check that every exposed action's program can be found.
    pub fn check_commands(&self) -> Result<()> {
        for action in self.actions.iter().filter(|a| self.exposed(&a.signature.id)) {
            self.program_path(action)?;
        }
        Ok(())
    }
}

impl ActionRegistry for Manifest {
    fn resolve(&self, action_id: &str) -> Option<ActionSignature> {
        self.action(action_id).map(|a| a.signature.clone())
    }

    fn list(&self) -> Vec<ActionSignature> {
        self.actions
            .iter()
            .filter(|a| self.exposed(&a.signature.id))
            .map(|a| a.signature.clone())
            .collect()
    }

    fn timeout(&self, action_id: &str) -> Option<Duration> {
        self.action(action_id).and_then(ManifestAction::timeout)
    }
}
