pub mod api;
pub mod app_state;
pub mod config;
pub mod extract;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{Method, header};
use axum::routing::{get, post};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{ErrorResponse, HealthResponse, extract_frame, health, log_request_errors};
pub use app_state::AppState;
pub use config::Config;
pub use extract::{ExtractError, last_frame_jpeg};

pub async fn run(config: Config) {
    // Ensure we're in a proper async context by yielding once
    tokio::task::yield_now().await;

    // Extract configuration values
    let listen_on_port = config.listen_on_port;
    let jpeg_quality = config.jpeg_quality;
    let max_upload_bytes = config.max_upload_bytes;
    let workspace = config.workspace.clone();

    // Parse workspace path
    let workspace_path = PathBuf::from_str(&workspace).expect("Failed to parse workspace dir");

    let state = AppState::new(&workspace_path, jpeg_quality)
        .await
        .expect("Failed to create app state");

    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/extract-frame", post(extract_frame))
        .route("/health", get(health))
        // Uploads are whole videos; the axum default body limit is far too
        // small for them.
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state));

    let addr = format!("0.0.0.0:{listen_on_port}");
    info!("Listening on {addr}");
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind API listener");
    axum::serve(listener, app).await.expect("API server error");
}
