//! Action signatures and the collaborator seams the dispatcher calls through.
//!
//! An action is described by an explicit, declared signature: each parameter
//! is tagged with a [`ParamKind`] so secret binding needs no reflection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::injector::BoundParameters;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Supplied by the caller in the request body.
    #[default]
    Plain,
    /// Supplied from the decoded context's `secrets` map.
    Secret,
    /// Receives the decoded context's extra fields.
    Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSignature {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl ActionSignature {
    pub fn params_of_kind(&self, kind: ParamKind) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(move |p| p.kind == kind)
    }

    /// Names whose values must never be persisted with the run's inputs.
    pub fn sensitive_names(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|p| p.kind != ParamKind::Plain)
            .map(|p| p.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between the dispatcher and an action body.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Looks up registered actions.
pub trait ActionRegistry: Send + Sync {
    fn resolve(&self, action_id: &str) -> Option<ActionSignature>;
    fn list(&self) -> Vec<ActionSignature>;

    /// Per-action execution limit, when the registry declares one.
    fn timeout(&self, _action_id: &str) -> Option<std::time::Duration> {
        None
    }
}

/// Outcome of an action body that did not return normally.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeFailure {
    /// The body raised or returned an error.
    Error(String),
    /// The body observed the cancel token and stopped.
    Cancelled,
}

/// Runs an action body. Called on a blocking worker; may block indefinitely
/// but should poll `cancel` where it can.
pub trait ActionInvoker: Send + Sync {
    fn invoke(
        &self,
        signature: &ActionSignature,
        params: &BoundParameters,
        cancel: &CancelToken,
    ) -> std::result::Result<serde_json::Value, InvokeFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_defaults_to_required_plain() {
        let p: Parameter = serde_yaml::from_str("name: city").unwrap();
        assert_eq!(p.kind, ParamKind::Plain);
        assert!(p.required);
    }

    #[test]
    fn sensitive_names_cover_secret_and_context() {
        let sig: ActionSignature = serde_yaml::from_str(
            r#"
id: fetch
parameters:
  - { name: url }
  - { name: token, kind: secret }
  - { name: ctx, kind: context }
"#,
        )
        .unwrap();
        let names: Vec<_> = sig.sensitive_names().collect();
        assert_eq!(names, vec!["token", "ctx"]);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let seen_by_body = token.clone();
        assert!(!seen_by_body.is_cancelled());
        token.cancel();
        assert!(seen_by_body.is_cancelled());
    }
}
