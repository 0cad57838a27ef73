use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes::{backfill, health, query};
use crate::state::AppState;
use crate::workers::backfill::{BackfillJob, BackfillStatus};
use crate::workers::query::{
    Aggregation, AggregationSpec, ColdRangeInfo, QueryMetadata, QueryRequest, QueryResponse,
    RangeInfo, SeriesEntry,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_handler,
        query::query_get,
        query::query_post,
        backfill::start,
        backfill::status,
        backfill::cancel,
    ),
    components(schemas(
        health::HealthResponse,
        QueryRequest,
        QueryResponse,
        SeriesEntry,
        QueryMetadata,
        RangeInfo,
        ColdRangeInfo,
        Aggregation,
        AggregationSpec,
        backfill::StartBackfillRequest,
        backfill::StartBackfillResponse,
        BackfillJob,
        BackfillStatus,
    )),
    tags((name = "vitalslake", description = "Tiered time-series data lake"))
)]
struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).expect("OpenAPI document always serializes")
}

pub(crate) async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
