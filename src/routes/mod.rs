//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The hub exposes one WebSocket endpoint for participants plus two plain
//! HTTP endpoints: a liveness probe and a read-only session dump.

pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::services::session::{self, HubSnapshot};
use crate::state::AppState;

/// Hub routes.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/debug/sessions", get(debug_sessions))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn debug_sessions(State(state): State<AppState>) -> Json<HubSnapshot> {
    Json(session::snapshot(&state).await)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
