use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::LakeResult;
use crate::state::AppState;
use crate::workers::query::{Aggregation, AggregationSpec, QueryRequest, QueryResponse, QueryWorker};

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub site: String,
    /// Comma-separated point names.
    pub point_names: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub window_seconds: Option<i64>,
}

impl From<QueryParams> for QueryRequest {
    fn from(params: QueryParams) -> Self {
        QueryRequest {
            site: params.site,
            point_names: params
                .point_names
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            start_time: params.start_time,
            end_time: params.end_time,
            aggregation: match (params.aggregation, params.window_seconds) {
                (Some(reducer), Some(window_seconds)) => {
                    Some(AggregationSpec { window_seconds, reducer })
                }
                _ => None,
            },
        }
    }
}

fn worker(
    state: &AppState,
) -> QueryWorker<
    crate::store::hot::PostgresHotStore,
    crate::store::cold::FsColdStore,
    crate::store::state_store::PostgresStateStore,
> {
    QueryWorker::new(
        state.db.clone(),
        state.hot.clone(),
        state.cold.clone(),
        state.state_store.clone(),
        state.config.clone(),
    )
}

#[utoipa::path(
    get,
    path = "/timeseries/query",
    params(
        ("site" = String, Query, description = "Site name"),
        ("point_names" = String, Query, description = "Comma-separated point names"),
        ("start_time" = String, Query, description = "RFC3339 start timestamp"),
        ("end_time" = String, Query, description = "RFC3339 end timestamp"),
        ("aggregation" = Option<String>, Query, description = "mean | min | max | last"),
        ("window_seconds" = Option<i64>, Query, description = "Aggregation bucket width in seconds"),
    ),
    responses((status = 200, description = "Query result"))
)]
pub(crate) async fn query_get(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> LakeResult<Json<QueryResponse>> {
    let response = worker(&state).run(params.into()).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/timeseries/query",
    request_body = QueryRequest,
    responses((status = 200, description = "Query result"))
)]
pub(crate) async fn query_post(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> LakeResult<Json<QueryResponse>> {
    let response = worker(&state).run(req).await?;
    Ok(Json(response))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/timeseries/query", get(query_get).post(query_post))
}
