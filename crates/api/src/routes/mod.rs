//! API routes

pub mod auth;
pub mod callbacks;
pub mod chat;
pub mod health;
pub mod presence;
pub mod uploads;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, patch, post},
    Router,
};

use crate::{auth::require_worker, state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (customers are anonymous) - under /api/v1
    let public_api_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/chat/admit", post(chat::admit))
        .route("/chat/:room_id/messages", get(chat::history))
        .route("/chat/:room_id/rating", post(chat::rate))
        .route("/callbacks", post(callbacks::create_callback))
        .route(
            "/uploads",
            post(uploads::upload).layer(DefaultBodyLimit::max(state.config.max_upload_bytes)),
        );

    // Worker-only routes (bearer token required)
    let protected_api_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/callbacks", get(callbacks::list_callbacks))
        .route("/callbacks/:callback_id", patch(callbacks::update_callback))
        .route("/presence", get(presence::snapshot))
        .layer(middleware::from_fn_with_state(state.clone(), require_worker));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .route("/ws", get(ws_handler))
        .nest("/api/v1", api_v1_routes)
        .with_state(state)
}
