use crate::state::AppState;
use axum::Router;

pub mod claims;
pub mod cookies;
pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod password;
pub mod services;

pub use extractors::AuthUser;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::session_routes())
}
