//! API route definitions.

mod alerts;
mod health;

use axum::Router;

use super::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/alerts", alerts::router())
        .nest("/health", health::router())
        .with_state(state)
}
