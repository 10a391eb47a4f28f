use axum::{routing::get, Router};

use crate::state::AppState;

pub mod autopay;
pub mod health;
pub mod webhooks;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(autopay::router())
        .merge(webhooks::router())
}
