//! HTTP/WebSocket API surface.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::manager::ConnectionManager;

mod error;
mod handlers;
mod ws;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/leitstelle", post(handlers::create_session))
        .route("/ws/{code}", get(ws::ws_endpoint))
        .route("/api/leitstelle_info/{code}", get(handlers::session_info))
        .route("/api/staffelfuehrer_info/{code}", get(handlers::leader_info))
        .route("/api/status_info", get(handlers::status_info))
        .route("/api/leitstelle/{code}/message", post(handlers::send_message))
        .route("/api/leitstelle/{code}/chat_history", get(handlers::chat_history))
        .route("/api/leitstelle/{code}/clear_special", post(handlers::clear_special))
        .route(
            "/api/leitstelle/{code}/clear_kurzstatus",
            post(handlers::clear_short_status),
        )
        .route("/api/leitstelle/{code}/update_note", post(handlers::update_note))
        .route("/api/leitstelle/{code}/set_status", post(handlers::set_status))
        .route("/api/staffelfuehrer/{code}/notice", post(handlers::create_notice))
        .route(
            "/api/staffelfuehrer/{code}/acknowledge",
            post(handlers::acknowledge_notice),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
