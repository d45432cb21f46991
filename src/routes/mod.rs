//! Route modules for Folio Server

use axum::{routing::get, Router};

use crate::state::AppState;

pub mod files;
pub mod health;

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/files", files::router())
        .with_state(state)
}
