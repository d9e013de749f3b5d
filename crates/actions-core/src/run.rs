//! Run data model.
//!
//! An `ActionRun` is the record of one invocation: which action was called,
//! where the invocation is in its lifecycle, and references to the stored
//! inputs and outputs. Decoded secrets never appear here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Lifecycle state of a run.
///
/// Transitions: `Queued → Running → Completed | Failed | Cancelled`, plus
/// `Queued → Cancelled` and `Queued → Failed` (rejected before the action
/// starts). Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Queued,
        RunState::Running,
        RunState::Completed,
        RunState::Failed,
        RunState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown run state '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// ErrorKind / RunError
// ---------------------------------------------------------------------------

/// Why a run ended in `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedEncoding,
    MalformedPayload,
    UnsupportedAlgorithm,
    DecryptionFailed,
    MissingSecret,
    Timeout,
    ActionError,
    Cancelled,
}

impl ErrorKind {
    /// Decode and injection failures: the action body was never invoked.
    pub fn is_security_error(self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedEncoding
                | ErrorKind::MalformedPayload
                | ErrorKind::UnsupportedAlgorithm
                | ErrorKind::DecryptionFailed
                | ErrorKind::MissingSecret
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// ActionRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRun {
    pub id: Uuid,
    pub action_id: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs_ref: Option<String>,
    #[serde(default)]
    pub outputs_ref: Option<String>,
    #[serde(default)]
    pub error: Option<RunError>,
    /// Index of the decryption key that authenticated the context, if any.
    #[serde(default)]
    pub key_index: Option<usize>,
}

impl ActionRun {
    /// Create a new run in `Queued` state.
    pub fn new(action_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id: action_id.into(),
            state: RunState::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
            inputs_ref: None,
            outputs_ref: None,
            error: None,
            key_index: None,
        }
    }

    /// Apply a state change in memory, stamping `started_at` / `ended_at`.
    ///
    /// Timestamps are only written when unset, so each is set at most once.
    pub(crate) fn apply(&mut self, to: RunState, at: DateTime<Utc>) {
        self.state = to;
        if to == RunState::Running && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if to.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(at);
        }
    }
}

pub fn inputs_ref(id: Uuid) -> String {
    format!("runs/{id}/inputs")
}

pub fn outputs_ref(id: Uuid) -> String {
    format!("runs/{id}/outputs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_allow_no_transition() {
        for from in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            for to in RunState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} allowed");
            }
        }
    }

    #[test]
    fn running_cannot_go_back_to_queued() {
        assert!(!RunState::Running.can_transition_to(RunState::Queued));
        assert!(RunState::Running.can_transition_to(RunState::Completed));
        assert!(!RunState::Queued.can_transition_to(RunState::Completed));
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<RunState>().unwrap(), RunState::Running);
        assert!("paused".parse::<RunState>().is_err());
    }

    #[test]
    fn apply_sets_timestamps_once() {
        let t0 = Utc::now();
        let mut run = ActionRun::new("greet", t0);
        let t1 = t0 + chrono::Duration::seconds(1);
        run.apply(RunState::Running, t1);
        assert_eq!(run.started_at, Some(t1));
        assert_eq!(run.ended_at, None);

        let t2 = t1 + chrono::Duration::seconds(1);
        run.apply(RunState::Completed, t2);
        assert_eq!(run.started_at, Some(t1));
        assert_eq!(run.ended_at, Some(t2));
    }

    #[test]
    fn record_roundtrips_through_json_with_missing_optionals() {
        let run = ActionRun::new("greet", Utc::now());
        let mut value = serde_json::to_value(&run).unwrap();
        value.as_object_mut().unwrap().remove("key_index");
        value.as_object_mut().unwrap().remove("error");
        let back: ActionRun = serde_json::from_value(value).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn security_kinds_exclude_runtime_failures() {
        assert!(ErrorKind::DecryptionFailed.is_security_error());
        assert!(!ErrorKind::Timeout.is_security_error());
        assert!(!ErrorKind::ActionError.is_security_error());
    }
}
