pub mod backfill;
pub mod health;
pub mod query;

use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::AUTHORIZATION, axum::http::header::CONTENT_TYPE]);
    if allowed_origins.is_empty() {
        return layer;
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(origins)
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    Router::new()
        .merge(health::router())
        .merge(query::router())
        .merge(backfill::router())
        .merge(crate::openapi::router())
        .layer(cors)
        .with_state(state)
}
