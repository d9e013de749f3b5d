use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Gate `/api/*` behind `Authorization: Bearer <api_key>` when a key is configured.
///
/// Without a configured key every request passes through.
pub async fn api_key_middleware(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = app.api_key.as_deref() else {
        return next.run(req).await;
    };
    if !req.uri().path().starts_with("/api/") {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if let Some(token) = provided {
        if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
            return next.run(req).await;
        }
    }

    tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
    let mut response = Response::new(Body::from(r#"{"error":"unauthorized"}"#));
    *response.status_mut() = axum::http::StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}
