use std::future::Future;

use axum::extract::{FromRef, FromRequestParts, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::state::AppState;
use crate::workers::backfill::{self, BackfillJob};

/// Requires `Authorization: Bearer <backfill_bearer_token>`, checked in
/// constant time. This is a separate credential from the upstream vendor's
/// API token: it gates who may trigger re-ingest against this lake, not who
/// this lake authenticates as to the vendor.
pub struct BackfillAuth;

impl<S> FromRequestParts<S> for BackfillAuth
where
    LakeConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = LakeError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let config = LakeConfig::from_ref(state);
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        async move {
            let expected = config.backfill_bearer_token.as_bytes();
            if expected.is_empty()
                || presented.is_empty()
                || presented.as_bytes().ct_eq(expected).unwrap_u8() != 1
            {
                return Err(LakeError::Auth("invalid backfill credential".to_string()));
            }
            Ok(BackfillAuth)
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StartBackfillRequest {
    pub site: String,
    pub start_day: NaiveDate,
    /// Exclusive end of the requested range.
    pub end_day: NaiveDate,
    /// Reuse an existing job's progress for this exact `(site, start_day,
    /// end_day)` instead of starting over from an empty `completed_days`.
    #[serde(default)]
    pub resume: Option<bool>,
    #[serde(default)]
    pub continue_on_error: Option<bool>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StartBackfillResponse {
    pub job_id: String,
}

#[utoipa::path(
    post,
    path = "/backfill/start",
    request_body = StartBackfillRequest,
    responses((status = 200, description = "Backfill job created", body = StartBackfillResponse))
)]
pub(crate) async fn start(
    State(state): State<AppState>,
    _auth: BackfillAuth,
    Json(req): Json<StartBackfillRequest>,
) -> LakeResult<Json<StartBackfillResponse>> {
    let job_id = backfill::create_job(
        state.state_store.as_ref(),
        &state.config,
        &req.site,
        req.start_day,
        req.end_day,
        req.resume.unwrap_or(false),
        req.continue_on_error.unwrap_or(false),
    )
    .await?;

    state.backfill_worker.clone().spawn(job_id.clone());

    Ok(Json(StartBackfillResponse { job_id }))
}

#[derive(Debug, Deserialize)]
pub struct JobIdParams {
    pub job_id: String,
}

#[utoipa::path(
    get,
    path = "/backfill/status",
    params(("job_id" = String, Query, description = "Backfill job id")),
    responses((status = 200, description = "Backfill job status", body = BackfillJob))
)]
pub(crate) async fn status(
    State(state): State<AppState>,
    _auth: BackfillAuth,
    Query(params): Query<JobIdParams>,
) -> LakeResult<Json<BackfillJob>> {
    let job = backfill::load_job(state.state_store.as_ref(), &params.job_id)
        .await?
        .ok_or_else(|| LakeError::Validation(format!("unknown backfill job {}", params.job_id)))?;
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
pub struct CancelBackfillResponse {
    pub cancelled: bool,
}

#[utoipa::path(
    post,
    path = "/backfill/cancel",
    params(("job_id" = String, Query, description = "Backfill job id")),
    responses((status = 200, description = "Cancellation result", body = CancelBackfillResponse))
)]
pub(crate) async fn cancel(
    State(state): State<AppState>,
    _auth: BackfillAuth,
    Query(params): Query<JobIdParams>,
) -> LakeResult<Json<CancelBackfillResponse>> {
    let cancelled = backfill::cancel_job(state.state_store.as_ref(), &params.job_id).await?;
    Ok(Json(CancelBackfillResponse { cancelled }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backfill/start", post(start))
        .route("/backfill/status", get(status))
        .route("/backfill/cancel", post(cancel))
}
