pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod routes;
pub mod state;

use actions_core::config::ServerConfig;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Actions
        .route("/api/actions", get(routes::actions::list_actions))
        .route(
            "/api/actions/{action_id}/run",
            post(routes::actions::run_action),
        )
        // Runs
        .route("/api/runs", get(routes::runs::list_runs))
        .route("/api/runs/events", get(routes::events::run_events))
        .route("/api/runs/{run_id}", get(routes::runs::get_run))
        .route("/api/runs/{run_id}/outputs", get(routes::runs::get_outputs))
        .route("/api/runs/{run_id}/cancel", post(routes::runs::cancel_run))
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            auth::api_key_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the action server on `config.address:config.port`.
pub async fn serve(config: &ServerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app_state = AppState::from_config(config)?;
    serve_on(app_state, listener).await
}

/// Serve on a pre-bound listener until Ctrl-C.
///
/// Lets the caller read the actual port first (useful with port 0).
pub async fn serve_on(app_state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    let app = build_router(app_state);

    tracing::info!("action server listening on http://{local}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("action server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
