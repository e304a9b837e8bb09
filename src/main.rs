use std::sync::Arc;

use tower_http::cors::CorsLayer;

use matchpoint_backend::api;
use matchpoint_backend::config::Config;
use matchpoint_backend::db::Database;
use matchpoint_backend::metrics;
use matchpoint_backend::session::MatchService;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    sqlx::any::install_default_drivers();

    let config = Config::load();
    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    metrics::register_metrics();

    let service = MatchService::new(db, config.matchmaking.clone());
    let app = api::router(service).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to port {}: {e}", config.port));

    tracing::info!("matchpoint backend listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
