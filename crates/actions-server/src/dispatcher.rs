//! Run lifecycle: admission, bounded execution, timeout and cancellation.
//!
//! Every invocation follows the same path:
//!
//! 1. resolve the action (unknown ids fail before any run exists)
//! 2. create the run `Queued` and persist the non-sensitive inputs
//! 3. decode the context header and bind secrets; a failure here ends the
//!    run `Failed` with the decode/injection kind and the body never runs
//! 4. wait for an execution permit, move to `Running`
//! 5. run the body on a blocking worker under a deadline, then record exactly
//!    one terminal state
//!
//! Terminal writes race with `cancel`. The registry lets exactly one win; the
//! loser gets `InvalidTransition`, which is logged and dropped here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actions_core::action::{ActionInvoker, ActionRegistry, ActionSignature, CancelToken, InvokeFailure};
use actions_core::context::{self, ActionContext};
use actions_core::injector::{self, BoundParameters};
use actions_core::keyring::KeyRing;
use actions_core::registry::RunRegistry;
use actions_core::run::{ActionRun, ErrorKind, RunError, RunState};
use actions_core::{ActionsError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Semaphore};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Requests and events
// ---------------------------------------------------------------------------

/// One call to an action.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    pub action_id: String,
    /// Plain parameters from the request body.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Raw `x-action-context` header bytes. `None` means an empty context.
    pub context: Option<Vec<u8>>,
    /// Overrides the action's own timeout and the server default.
    pub timeout: Option<Duration>,
}

/// Published on every persisted state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub action_id: String,
    pub state: RunState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl From<&ActionRun> for RunEvent {
    fn from(run: &ActionRun) -> Self {
        Self {
            run_id: run.id,
            action_id: run.action_id.clone(),
            state: run.state,
            at: run.ended_at.or(run.started_at).unwrap_or(run.created_at),
            error: run.error.as_ref().map(|e| e.kind),
        }
    }
}

/// Result of admission: either the run already ended, or it is ready to execute.
enum Admission {
    Rejected(ActionRun),
    Ready(Prepared),
}

struct Prepared {
    run: ActionRun,
    signature: ActionSignature,
    params: BoundParameters,
    timeout: Duration,
    token: CancelToken,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    actions: Arc<dyn ActionRegistry>,
    invoker: Arc<dyn ActionInvoker>,
    registry: Arc<RunRegistry>,
    keyring: Arc<KeyRing>,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
    events: broadcast::Sender<RunEvent>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        actions: Arc<dyn ActionRegistry>,
        invoker: Arc<dyn ActionInvoker>,
        registry: Arc<RunRegistry>,
        keyring: Arc<KeyRing>,
        max_processes: usize,
        default_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            actions,
            invoker,
            registry,
            keyring,
            permits: Arc::new(Semaphore::new(max_processes.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
            events,
            default_timeout,
        }
    }

    pub fn actions(&self) -> &Arc<dyn ActionRegistry> {
        &self.actions
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Run an action and wait for its terminal state.
    ///
    /// The run lives on its own task, so dropping the returned future (a
    /// client disconnect) does not strand it.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<ActionRun> {
        let this = self.clone();
        tokio::spawn(async move { this.run_to_end(request).await })
            .await
            .map_err(|e| ActionsError::RunDb(format!("invocation task failed: {e}")))?
    }

    async fn run_to_end(&self, request: InvokeRequest) -> Result<ActionRun> {
        match self.admit(request).await? {
            Admission::Rejected(run) => Ok(run),
            Admission::Ready(prepared) => self.execute(prepared).await,
        }
    }

    /// Start an action in the background and return its `Queued` run.
    ///
    /// Decode and injection failures are still reported synchronously: the
    /// returned run is already `Failed`.
    pub async fn submit(&self, request: InvokeRequest) -> Result<ActionRun> {
        let this = self.clone();
        let (admitted, outcome) = oneshot::channel();
        tokio::spawn(async move {
            let prepared = match this.admit(request).await {
                Ok(Admission::Ready(prepared)) => prepared,
                Ok(Admission::Rejected(run)) => {
                    let _ = admitted.send(Ok(run));
                    return;
                }
                Err(e) => {
                    let _ = admitted.send(Err(e));
                    return;
                }
            };
            // The caller may be gone; the run continues regardless.
            let _ = admitted.send(Ok(prepared.run.clone()));
            let id = prepared.run.id;
            if let Err(e) = this.execute(prepared).await {
                tracing::error!(run_id = %id, error = %e, "background run failed");
            }
        });
        outcome
            .await
            .map_err(|_| ActionsError::RunDb("submission task ended before admission".into()))?
    }

    /// Cancel a queued or running run.
    ///
    /// A queued run ends `Cancelled` at once. A running run is only
    /// signalled: it ends `Cancelled` when the body stops on the signal, or
    /// runs on until it returns or times out. A run that already ended
    /// yields `InvalidTransition`.
    pub async fn cancel(&self, id: Uuid) -> Result<ActionRun> {
        if let Some(token) = self.token(id) {
            token.cancel();
        }
        let run = self
            .with_registry(move |r| r.cancel_if_queued(id, "cancelled by request", Utc::now()))
            .await?;
        if run.state == RunState::Cancelled {
            tracing::info!(run_id = %id, action = %run.action_id, "queued run cancelled");
            self.publish(&run);
        } else {
            tracing::info!(run_id = %id, action = %run.action_id, "cancel signalled to running action");
        }
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    async fn admit(&self, request: InvokeRequest) -> Result<Admission> {
        let InvokeRequest {
            action_id,
            inputs,
            context: header,
            timeout,
        } = request;

        let signature = self
            .actions
            .resolve(&action_id)
            .ok_or_else(|| ActionsError::ActionNotFound(action_id.clone()))?;
        let timeout = timeout
            .or_else(|| self.actions.timeout(&action_id))
            .unwrap_or(self.default_timeout);

        let run = {
            let action_id = action_id.clone();
            self.with_registry(move |r| r.create(&action_id)).await?
        };
        let id = run.id;
        let token = CancelToken::new();
        self.track(id, token.clone());
        tracing::info!(run_id = %id, action = %action_id, "run queued");
        self.publish(&run);

        let admission = self
            .bind(run, signature, inputs, header, timeout, token)
            .await;
        // Only a run that goes on to execute keeps its cancel token.
        if !matches!(admission, Ok(Admission::Ready(_))) {
            self.untrack(id);
        }
        admission
    }

    /// Persist the inputs, decode the context and bind the parameters of a
    /// freshly queued run.
    async fn bind(
        &self,
        run: ActionRun,
        signature: ActionSignature,
        inputs: serde_json::Map<String, serde_json::Value>,
        header: Option<Vec<u8>>,
        timeout: Duration,
        token: CancelToken,
    ) -> Result<Admission> {
        let id = run.id;
        let mut stored = inputs.clone();
        for name in signature.sensitive_names() {
            stored.remove(name);
        }
        let run = self
            .with_registry(move |r| r.record_inputs(id, &serde_json::Value::Object(stored)))
            .await?;

        let decoded = match header {
            Some(raw) => context::decode(&raw, &self.keyring),
            None => Ok(ActionContext::default()),
        };
        let bound = decoded.and_then(|ctx| {
            injector::inject(&signature, inputs, &ctx).map(|params| (params, ctx.key_index))
        });

        match bound {
            Ok((params, key_index)) => {
                let run = match key_index {
                    Some(index) => {
                        tracing::debug!(run_id = %id, key_index = index, "context decrypted");
                        self.with_registry(move |r| r.set_key_index(id, index)).await?
                    }
                    None => run,
                };
                Ok(Admission::Ready(Prepared {
                    run,
                    signature,
                    params,
                    timeout,
                    token,
                }))
            }
            Err(e) => {
                let Some(kind) = e.kind() else {
                    return Err(e);
                };
                tracing::warn!(run_id = %id, action = %run.action_id, %kind, "invocation rejected");
                let error = RunError {
                    kind,
                    message: e.to_string(),
                };
                let run = self
                    .finish(id, move |r| r.fail(id, error, Utc::now()))
                    .await?;
                Ok(Admission::Rejected(run))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(&self, prepared: Prepared) -> Result<ActionRun> {
        let id = prepared.run.id;
        let result = self.execute_tracked(prepared).await;
        self.untrack(id);
        result
    }

    async fn execute_tracked(&self, prepared: Prepared) -> Result<ActionRun> {
        let Prepared {
            run,
            signature,
            params,
            timeout,
            token,
        } = prepared;
        let id = run.id;

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ActionsError::RunDb(format!("execution permits closed: {e}")))?;

        if token.is_cancelled() {
            drop(permit);
            return self
                .finish(id, move |r| r.cancel(id, "cancelled by request", Utc::now()))
                .await;
        }
        let run = match self
            .with_registry(move |r| r.transition(id, RunState::Running, Utc::now()))
            .await
        {
            Ok(run) => run,
            Err(ActionsError::InvalidTransition { from, to }) => {
                // Cancelled while waiting for a permit.
                tracing::warn!(run_id = %id, %from, %to, "run left the queue before starting");
                return self.with_registry(move |r| r.get(id)).await;
            }
            Err(e) => return Err(e),
        };
        tracing::info!(run_id = %id, action = %run.action_id, timeout_secs = timeout.as_secs(), "run started");
        self.publish(&run);

        let body = {
            let invoker = self.invoker.clone();
            let token = token.clone();
            tokio::task::spawn_blocking(move || {
                // The permit is held until the body returns, even past a timeout.
                let _permit = permit;
                invoker.invoke(&signature, &params, &token)
            })
        };

        match tokio::time::timeout(timeout, body).await {
            Err(_) => {
                token.cancel();
                tracing::warn!(run_id = %id, timeout_secs = timeout.as_secs(), "run timed out");
                let error = RunError {
                    kind: ErrorKind::Timeout,
                    message: format!("action exceeded {}s timeout", timeout.as_secs()),
                };
                self.finish(id, move |r| r.fail(id, error, Utc::now())).await
            }
            Ok(Err(join)) => {
                tracing::error!(run_id = %id, error = %join, "action body panicked");
                let error = RunError {
                    kind: ErrorKind::ActionError,
                    message: "action body panicked".into(),
                };
                self.finish(id, move |r| r.fail(id, error, Utc::now())).await
            }
            Ok(Ok(Ok(outputs))) => {
                tracing::info!(run_id = %id, "run completed");
                self.finish(id, move |r| r.complete(id, &outputs, Utc::now()))
                    .await
            }
            Ok(Ok(Err(InvokeFailure::Cancelled))) => {
                self.finish(id, move |r| r.cancel(id, "action stopped on cancel", Utc::now()))
                    .await
            }
            Ok(Ok(Err(InvokeFailure::Error(message)))) => {
                tracing::info!(run_id = %id, "run failed");
                let error = RunError {
                    kind: ErrorKind::ActionError,
                    message,
                };
                self.finish(id, move |r| r.fail(id, error, Utc::now())).await
            }
        }
    }

    /// Apply a terminal write. Losing a race to another terminal write is not
    /// an error for the caller: the winner's record is returned instead.
    async fn finish<F>(&self, id: Uuid, write: F) -> Result<ActionRun>
    where
        F: FnOnce(&RunRegistry) -> Result<ActionRun> + Send + 'static,
    {
        match self.with_registry(write).await {
            Ok(run) => {
                self.publish(&run);
                Ok(run)
            }
            Err(ActionsError::InvalidTransition { from, to }) => {
                tracing::warn!(run_id = %id, %from, %to, "discarded losing terminal transition");
                self.with_registry(move |r| r.get(id)).await
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Run a registry call off the async runtime.
    async fn with_registry<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RunRegistry) -> Result<T> + Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| ActionsError::RunDb(format!("registry task failed: {e}")))?
    }

    fn publish(&self, run: &ActionRun) {
        // No subscribers is fine.
        let _ = self.events.send(RunEvent::from(run));
    }

    fn track(&self, id: Uuid, token: CancelToken) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token);
    }

    fn untrack(&self, id: Uuid) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn token(&self, id: Uuid) -> Option<CancelToken> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}
