use crate::state::AppState;
use axum::Router;

mod claims;
pub mod delivery;
mod dto;
pub(crate) mod extractors;
pub mod handlers;
pub mod jwt;
#[cfg(test)]
pub mod memory;
pub mod otp;
pub mod password;
pub mod repo;
mod repo_types;
pub mod reset;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
        .merge(handlers::reset_routes())
        .merge(handlers::admin_routes())
}
