use actions_core::registry::{RunFilter, RunRegistry};
use actions_core::run::{ActionRun, RunState};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    /// Comma-separated states, e.g. `failed,cancelled`.
    pub state: Option<String>,
    pub action_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl RunsQuery {
    fn into_filter(self) -> Result<RunFilter, AppError> {
        let states = match self.state.as_deref() {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<RunState>().map_err(AppError::bad_request))
                .collect::<Result<_, _>>()?,
        };
        Ok(RunFilter {
            states,
            action_id: self.action_id,
            created_after: self.since,
            created_before: self.until,
            offset: self.offset.unwrap_or(0),
            limit: Some(self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)),
        })
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::bad_request(format!("invalid run id '{raw}'")))
}

/// Run a registry read on the blocking pool.
async fn read<T, F>(app: &AppState, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&RunRegistry) -> actions_core::Result<T> + Send + 'static,
{
    let registry = app.dispatcher.registry().clone();
    Ok(tokio::task::spawn_blocking(move || f(&registry)).await??)
}

/// GET /api/runs, newest first.
pub async fn list_runs(
    State(app): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<ActionRun>>, AppError> {
    let filter = query.into_filter()?;
    let runs = read(&app, move |r| r.list(&filter)).await?;
    Ok(Json(runs))
}

/// GET /api/runs/{run_id}
pub async fn get_run(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ActionRun>, AppError> {
    let id = parse_run_id(&run_id)?;
    let run = read(&app, move |r| r.get(id)).await?;
    Ok(Json(run))
}

/// GET /api/runs/{run_id}/outputs
pub async fn get_outputs(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_run_id(&run_id)?;
    let run = read(&app, move |r| r.get(id)).await?;
    let Some(reference) = run.outputs_ref else {
        return Err(AppError::not_found(format!(
            "run {id} has no outputs (state: {})",
            run.state
        )));
    };
    let outputs = read(&app, move |r| r.get_payload(&reference)).await?;
    Ok(Json(outputs))
}

/// POST /api/runs/{run_id}/cancel
pub async fn cancel_run(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ActionRun>, AppError> {
    let id = parse_run_id(&run_id)?;
    let run = app.dispatcher.cancel(id).await?;
    Ok(Json(run))
}
