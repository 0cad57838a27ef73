use std::collections::BTreeMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;
use crate::store::cold::ColdStore;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub services: BTreeMap<String, String>,
}

async fn probe_database(state: &AppState) -> &'static str {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => "up",
        Err(err) => {
            tracing::warn!(error = %err, "health check: database probe failed");
            "down"
        }
    }
}

async fn probe_cold_store(state: &AppState) -> &'static str {
    match state.cold.list_prefix("").await {
        Ok(_) => "up",
        Err(err) => {
            tracing::warn!(error = %err, "health check: cold store probe failed");
            "down"
        }
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "OK", body = HealthResponse))
)]
pub(crate) async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut services = BTreeMap::new();
    services.insert("database".to_string(), probe_database(&state).await.to_string());
    services.insert("cold_store".to_string(), probe_cold_store(&state).await.to_string());

    let status = if services.values().all(|v| v == "up") {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        services,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
