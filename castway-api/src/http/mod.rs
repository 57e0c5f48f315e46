// Module: http
// WHIP/WHEP HTTP API

pub mod auth;
pub mod error;
pub mod health;
pub mod status;
pub mod whep;
pub mod whip;

use axum::{
    routing::{get, post},
    Router,
};
use castway_sfu::SfuManager;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<SfuManager>,
}

/// Create the HTTP router with all routes
pub fn create_router(sfu: Arc<SfuManager>) -> Router {
    let state = AppState { sfu };

    Router::new()
        .route("/api/whip", post(whip::publish))
        .route("/api/whep", post(whep::subscribe))
        .route("/api/sse/{session_id}", get(whep::layer_events))
        .route("/api/layer/{session_id}", post(whep::switch_layer))
        .route("/api/status", get(status::list_streams))
        .merge(health::create_health_router())
        // Browsers must be able to read the WHEP Link and Location headers
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
