use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::{api, AppState};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Ingestion
        .route("/webhook", post(api::post_webhook))
        // Dashboard data
        .route("/api/snapshot", get(api::get_snapshot))
        .route("/api/strategies", get(api::get_strategies))
        .route("/api/reset", post(api::post_reset))
        .route("/api/notifications", get(api::get_notifications))
        .route("/api/notifications/test", get(api::test_line))
        .route("/api/health", get(api::health_check))
        // Export
        .route("/download/log.json", get(api::download_log))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Webhook ledger listening on http://localhost:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
