use std::time::Duration;

use actions_core::action::ActionSignature;
use actions_core::context::CONTEXT_HEADER;
use actions_core::run::{ActionRun, ErrorKind, RunState};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::dispatcher::InvokeRequest;
use crate::error::AppError;
use crate::state::AppState;

pub const TIMEOUT_HEADER: &str = "x-action-timeout";
pub const ASYNC_HEADER: &str = "x-action-async";

/// GET /api/actions: every exposed action with its declared parameters.
pub async fn list_actions(State(app): State<AppState>) -> Json<Vec<ActionSignature>> {
    Json(app.dispatcher.actions().list())
}

/// POST /api/actions/{action_id}/run
///
/// Body: JSON object of plain parameters (empty body means none).
/// Headers: `x-action-context`, `x-action-timeout` (seconds),
/// `x-action-async: true` to return 202 with the queued run.
pub async fn run_action(
    State(app): State<AppState>,
    Path(action_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let inputs = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Map::new()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| AppError::bad_request("request body must be a JSON object"))?
    };
    let request = InvokeRequest {
        action_id,
        inputs,
        context: headers
            .get(CONTEXT_HEADER)
            .map(|v| v.as_bytes().to_vec()),
        timeout: parse_timeout(&headers)?,
    };

    let run_async = headers
        .get(ASYNC_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

    if run_async {
        let run = app.dispatcher.submit(request).await?;
        if run.state == RunState::Queued {
            return Ok((StatusCode::ACCEPTED, Json(run)).into_response());
        }
        return Ok(outcome_response(run, None));
    }

    let run = app.dispatcher.invoke(request).await?;
    let outputs = match run.outputs_ref.clone() {
        Some(reference) => {
            let registry = app.dispatcher.registry().clone();
            Some(tokio::task::spawn_blocking(move || registry.get_payload(&reference)).await??)
        }
        None => None,
    };
    Ok(outcome_response(run, outputs))
}

fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, AppError> {
    let Some(raw) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let timeout = raw
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|s| *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .filter(|d| !d.is_zero())
        .ok_or_else(|| {
            AppError::bad_request(format!("{TIMEOUT_HEADER} must be a positive number of seconds"))
        })?;
    Ok(Some(timeout))
}

/// Map a finished run onto a status code.
fn outcome_response(run: ActionRun, outputs: Option<serde_json::Value>) -> Response {
    let Some(error) = run.error.clone() else {
        let body = serde_json::json!({
            "run": run,
            "outputs": outputs.unwrap_or(serde_json::Value::Null),
        });
        return (StatusCode::OK, Json(body)).into_response();
    };
    let status = match error.kind {
        kind if kind.is_security_error() => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({
        "error": error.message,
        "kind": error.kind,
        "run": run,
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actions_core::run::RunError;
    use chrono::Utc;

    fn failed(kind: ErrorKind) -> ActionRun {
        let mut run = ActionRun::new("a", Utc::now());
        run.state = if kind == ErrorKind::Cancelled {
            RunState::Cancelled
        } else {
            RunState::Failed
        };
        run.error = Some(RunError {
            kind,
            message: "m".into(),
        });
        run
    }

    #[test]
    fn outcome_status_mapping() {
        let cases = [
            (ErrorKind::MalformedEncoding, StatusCode::BAD_REQUEST),
            (ErrorKind::MissingSecret, StatusCode::BAD_REQUEST),
            (ErrorKind::DecryptionFailed, StatusCode::BAD_REQUEST),
            (ErrorKind::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (ErrorKind::ActionError, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Cancelled, StatusCode::CONFLICT),
        ];
        for (kind, status) in cases {
            assert_eq!(outcome_response(failed(kind), None).status(), status, "{kind}");
        }
    }

    #[test]
    fn completed_run_is_200() {
        let mut run = ActionRun::new("a", Utc::now());
        run.state = RunState::Completed;
        assert_eq!(outcome_response(run, None).status(), StatusCode::OK);
    }

    #[test]
    fn timeout_header_must_be_positive() {
        let mut headers = HeaderMap::new();
        assert!(parse_timeout(&headers).unwrap().is_none());

        headers.insert(TIMEOUT_HEADER, "1.5".parse().unwrap());
        assert_eq!(
            parse_timeout(&headers).unwrap(),
            Some(Duration::from_millis(1500))
        );

        headers.insert(TIMEOUT_HEADER, "-3".parse().unwrap());
        assert!(parse_timeout(&headers).is_err());
        headers.insert(TIMEOUT_HEADER, "soon".parse().unwrap());
        assert!(parse_timeout(&headers).is_err());
        headers.insert(TIMEOUT_HEADER, "inf".parse().unwrap());
        assert!(parse_timeout(&headers).is_err());
        // Too large for a Duration.
        headers.insert(TIMEOUT_HEADER, "1e30".parse().unwrap());
        assert!(parse_timeout(&headers).is_err());
    }
}
