mod auth;
mod error;

use axum::Router;

pub use auth::AuthState;

/// Create the API router.
pub fn create_api_router(state: AuthState) -> Router {
    Router::new().nest("/auth", auth::router(state))
}
