use thiserror::Error;

use crate::run::{ErrorKind, RunState};

#[derive(Debug, Error)]
pub enum ActionsError {
    #[error("context header is not valid base64")]
    MalformedEncoding,

    #[error("context payload is malformed: {0}")]
    MalformedPayload(String),

    #[error("unsupported context algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("context could not be decrypted with any configured key")]
    DecryptionFailed,

    #[error("missing secret for parameter '{0}'")]
    MissingSecret(String),

    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("payload not found: {0}")]
    PayloadNotFound(String),

    #[error("invalid decryption key configuration: {0}")]
    InvalidKeyConfig(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid action manifest: {0}")]
    InvalidManifest(String),

    #[error("command not found for action '{action}': {command}")]
    CommandNotFound { action: String, command: String },

    #[error("run database error: {0}")]
    RunDb(String),

    #[error("run database schema v{found} needs migration to v{current}: run 'action-server migrate'")]
    MigrationPending { found: u64, current: u64 },

    #[error("run database schema v{0} is newer than this server supports")]
    UnsupportedSchema(u64),

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ActionsError {
    /// The failure kind recorded on a run when this error ends it.
    ///
    /// Only decode and injection errors have one; everything else is an
    /// infrastructure fault rather than an invocation outcome.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ActionsError::MalformedEncoding => Some(ErrorKind::MalformedEncoding),
            ActionsError::MalformedPayload(_) => Some(ErrorKind::MalformedPayload),
            ActionsError::UnsupportedAlgorithm(_) => Some(ErrorKind::UnsupportedAlgorithm),
            ActionsError::DecryptionFailed => Some(ErrorKind::DecryptionFailed),
            ActionsError::MissingSecret(_) => Some(ErrorKind::MissingSecret),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ActionsError>;
