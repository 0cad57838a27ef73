use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::codec::{EncodedRow, StreamingParquetEncoder};
use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::points;
use crate::store::cold::ColdStore;
use crate::store::state_store::StateStore;
use crate::upstream::UpstreamClient;

const JOB_PREFIX: &str = "backfill_job/";

fn job_key(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl BackfillStatus {
    fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BackfillJob {
    pub job_id: String,
    pub site: String,
    pub start_day: NaiveDate,
    /// Exclusive end of the requested range.
    pub end_day: NaiveDate,
    pub status: BackfillStatus,
    pub completed_days: BTreeSet<NaiveDate>,
    /// When true, a per-day failure is recorded and the job moves on to the
    /// next day instead of aborting. Upstream auth rejections always abort
    /// regardless of this flag.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl BackfillJob {
    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("BackfillJob always serializes")
    }

    fn from_value(value: serde_json::Value) -> LakeResult<Self> {
        serde_json::from_value(value)
            .map_err(|err| LakeError::Internal(format!("corrupt backfill job record: {err}")))
    }
}

fn next_pending_day(job: &BackfillJob, skip: &BTreeSet<NaiveDate>) -> Option<NaiveDate> {
    let mut day = job.start_day;
    while day < job.end_day {
        if !job.completed_days.contains(&day) && !skip.contains(&day) {
            return Some(day);
        }
        day += chrono::Duration::days(1);
    }
    None
}

async fn jobs_for_site<S: StateStore>(state: &S, site: &str) -> LakeResult<Vec<BackfillJob>> {
    let keys = state.list_prefix(JOB_PREFIX).await?;
    let mut jobs = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some((value, _)) = state.get(&key).await? {
            let job = BackfillJob::from_value(value)?;
            if job.site == site {
                jobs.push(job);
            }
        }
    }
    Ok(jobs)
}

/// Starts (or, with `resume=true`, resumes) a bounded historical re-ingest
/// for `[start_day, end_day)` at `site`. The job is durable in the state
/// store so status/cancel can be polled or issued from a different process
/// than the one running it, and at most one job per site may be active at
/// a time.
pub async fn create_job<S: StateStore>(
    state: &S,
    config: &LakeConfig,
    site: &str,
    start_day: NaiveDate,
    end_day: NaiveDate,
    resume: bool,
    continue_on_error: bool,
) -> LakeResult<String> {
    if end_day <= start_day {
        return Err(LakeError::Validation(
            "backfill end_day must be after start_day".to_string(),
        ));
    }
    let range_days = (end_day - start_day).num_days();
    if range_days > config.backfill_max_range_days as i64 {
        return Err(LakeError::Validation(format!(
            "backfill range of {range_days} days exceeds the configured maximum of {} days",
            config.backfill_max_range_days
        )));
    }

    let existing = jobs_for_site(state, site).await?;

    if resume {
        if let Some(mut job) = existing
            .iter()
            .find(|job| job.start_day == start_day && job.end_day == end_day)
            .cloned()
        {
            if job.status.is_active() {
                return Ok(job.job_id);
            }
            let other_active = existing
                .iter()
                .any(|other| other.job_id != job.job_id && other.status.is_active());
            if other_active {
                return Err(LakeError::Validation(format!(
                    "a backfill job for site {site} is already in progress"
                )));
            }
            job.status = BackfillStatus::Queued;
            job.error = None;
            job.continue_on_error = continue_on_error;
            state.put(&job_key(&job.job_id), &job.to_value()).await?;
            return Ok(job.job_id);
        }
    }

    if existing.iter().any(|job| job.status.is_active()) {
        return Err(LakeError::Validation(format!(
            "a backfill job for site {site} is already in progress"
        )));
    }

    let job_id = Uuid::new_v4().to_string();
    let job = BackfillJob {
        job_id: job_id.clone(),
        site: site.to_string(),
        start_day,
        end_day,
        status: BackfillStatus::Queued,
        completed_days: BTreeSet::new(),
        continue_on_error,
        error: None,
    };
    state.put(&job_key(&job_id), &job.to_value()).await?;
    Ok(job_id)
}

pub async fn load_job<S: StateStore>(state: &S, job_id: &str) -> LakeResult<Option<BackfillJob>> {
    match state.get(&job_key(job_id)).await? {
        Some((value, _)) => Ok(Some(BackfillJob::from_value(value)?)),
        None => Ok(None),
    }
}

/// Requests cancellation. The running worker observes this between days and
/// stops; already-archived days are left in place.
pub async fn cancel_job<S: StateStore>(state: &S, job_id: &str) -> LakeResult<bool> {
    loop {
        let Some((value, version)) = state.get(&job_key(job_id)).await? else {
            return Ok(false);
        };
        let mut job = BackfillJob::from_value(value)?;
        if matches!(job.status, BackfillStatus::Completed | BackfillStatus::Failed) {
            return Ok(false);
        }
        job.status = BackfillStatus::Cancelled;
        if state
            .compare_and_swap(&job_key(job_id), Some(version), &job.to_value())
            .await?
        {
            return Ok(true);
        }
    }
}

/// Scans the state store for jobs left `queued`/`running` by a crash or
/// restart and resumes each from its last completed day. Called once at
/// startup so a backfill's lifetime isn't tied to the HTTP request that
/// started it.
pub async fn resume_incomplete_jobs<C: ColdStore, S: StateStore>(
    worker: &Arc<BackfillWorker<C, S>>,
) -> LakeResult<u32> {
    let keys = worker.state.list_prefix(JOB_PREFIX).await?;
    let mut resumed = 0u32;
    for key in keys {
        let Some((value, _)) = worker.state.get(&key).await? else {
            continue;
        };
        let job = BackfillJob::from_value(value)?;
        if job.status.is_active() {
            tracing::info!(job_id = %job.job_id, site = %job.site, "resuming incomplete backfill job after restart");
            Arc::clone(worker).spawn(job.job_id);
            resumed += 1;
        }
    }
    Ok(resumed)
}

/// Drives one backfill job to completion (or cancellation), processing at
/// most `config.backfill_max_days_per_invocation` days before yielding and
/// rescheduling itself so a single stuck job can't starve other work.
pub struct BackfillWorker<C: ColdStore, S: StateStore> {
    pool: PgPool,
    cold: Arc<C>,
    state: Arc<S>,
    upstream: UpstreamClient,
    config: LakeConfig,
}

impl<C: ColdStore, S: StateStore> BackfillWorker<C, S> {
    pub fn new(
        pool: PgPool,
        cold: Arc<C>,
        state: Arc<S>,
        upstream: UpstreamClient,
        config: LakeConfig,
    ) -> Self {
        Self {
            pool,
            cold,
            state,
            upstream,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, job_id: String) {
        tokio::spawn(async move {
            if let Err(err) = self.drive(job_id.clone()).await {
                tracing::error!(job_id, error = %err, "backfill job failed");
                let _ = self.mark_failed(&job_id, &err.to_string()).await;
            }
        });
    }

    async fn mark_failed(&self, job_id: &str, message: &str) -> LakeResult<()> {
        loop {
            let Some((value, version)) = self.state.get(&job_key(job_id)).await? else {
                return Ok(());
            };
            let mut job = BackfillJob::from_value(value)?;
            job.status = BackfillStatus::Failed;
            job.error = Some(message.to_string());
            if self
                .state
                .compare_and_swap(&job_key(job_id), Some(version), &job.to_value())
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn record_day_error(&self, job_id: &str, day: NaiveDate, message: &str) -> LakeResult<()> {
        loop {
            let Some((value, version)) = self.state.get(&job_key(job_id)).await? else {
                return Ok(());
            };
            let mut job = BackfillJob::from_value(value)?;
            job.error = Some(format!("{day}: {message}"));
            if self
                .state
                .compare_and_swap(&job_key(job_id), Some(version), &job.to_value())
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn mark_day_complete(&self, job_id: &str, day: NaiveDate) -> LakeResult<BackfillJob> {
        loop {
            let (value, version) = self
                .state
                .get(&job_key(job_id))
                .await?
                .ok_or_else(|| LakeError::Internal(format!("backfill job {job_id} disappeared")))?;
            let mut job = BackfillJob::from_value(value)?;
            job.completed_days.insert(day);
            if job.completed_days.len() as i64 >= (job.end_day - job.start_day).num_days() {
                job.status = BackfillStatus::Completed;
            }
            if self
                .state
                .compare_and_swap(&job_key(job_id), Some(version), &job.to_value())
                .await?
            {
                return Ok(job);
            }
        }
    }

    async fn mark_running(&self, job_id: &str) -> LakeResult<()> {
        loop {
            let (value, version) = self
                .state
                .get(&job_key(job_id))
                .await?
                .ok_or_else(|| LakeError::Internal(format!("backfill job {job_id} disappeared")))?;
            let mut job = BackfillJob::from_value(value)?;
            if job.status == BackfillStatus::Cancelled {
                return Ok(());
            }
            job.status = BackfillStatus::Running;
            if self
                .state
                .compare_and_swap(&job_key(job_id), Some(version), &job.to_value())
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn drive(self: &Arc<Self>, job_id: String) -> LakeResult<()> {
        self.mark_running(&job_id).await?;
        let per_request_delay = Duration::from_secs_f64(
            60.0 / self.config.backfill_requests_per_minute.max(1) as f64,
        );

        let mut processed_this_invocation = 0u32;
        let mut failed_this_invocation: BTreeSet<NaiveDate> = BTreeSet::new();
        loop {
            let Some(job) = load_job(self.state.as_ref(), &job_id).await? else {
                return Ok(());
            };
            if job.status == BackfillStatus::Cancelled || job.status == BackfillStatus::Completed {
                return Ok(());
            }
            let Some(day) = next_pending_day(&job, &failed_this_invocation) else {
                return Ok(());
            };

            if let Err(err) = self.backfill_day(&job.site, day).await {
                let fail_fast = matches!(
                    err,
                    LakeError::Auth(_)
                        | LakeError::UpstreamRejected { status: 401, .. }
                        | LakeError::UpstreamRejected { status: 403, .. }
                );
                if fail_fast || !job.continue_on_error {
                    return Err(err);
                }
                tracing::warn!(
                    job_id, site = %job.site, %day, error = %err,
                    "backfill day failed, continuing to next day per continue_on_error"
                );
                self.record_day_error(&job_id, day, &err.to_string()).await?;
                failed_this_invocation.insert(day);
            } else {
                self.mark_day_complete(&job_id, day).await?;
            }
            processed_this_invocation += 1;

            if processed_this_invocation >= self.config.backfill_max_days_per_invocation {
                let worker = Arc::clone(self);
                let job_id = job_id.clone();
                tokio::spawn(async move { worker.spawn_continuation(job_id).await });
                return Ok(());
            }

            tokio::time::sleep(per_request_delay).await;
        }
    }

    async fn spawn_continuation(self: Arc<Self>, job_id: String) {
        if let Err(err) = self.drive(job_id.clone()).await {
            tracing::error!(job_id, error = %err, "backfill continuation failed");
            let _ = self.mark_failed(&job_id, &err.to_string()).await;
        }
    }

    async fn backfill_day(&self, site: &str, day: NaiveDate) -> LakeResult<()> {
        let path = self
            .config
            .cold_partition_relative_path(site, day)
            .to_string_lossy()
            .replace('\\', "/");

        let start_ms = day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        let end_ms = (day + chrono::Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();

        let configured = points::list_points_for_site(&self.pool, site).await?;
        if configured.is_empty() {
            tracing::debug!(site, %day, "no configured points for site, nothing to backfill");
            return Ok(());
        }
        let allowed: std::collections::HashSet<&str> =
            configured.iter().map(|p| p.name.as_str()).collect();

        let samples = self.upstream.fetch_timeseries_window(site, start_ms, end_ms).await?;
        if samples.is_empty() {
            return Ok(());
        }

        let rows: Vec<EncodedRow> = samples
            .into_iter()
            .filter_map(|sample| {
                let value = sample.value?;
                if !allowed.contains(sample.name.as_str()) {
                    tracing::warn!(site, point = %sample.name, "sample for unconfigured point, skipping");
                    return None;
                }
                Some(EncodedRow {
                    timestamp_ms: sample.time.timestamp_millis(),
                    point_name: sample.name,
                    value,
                })
            })
            .collect();

        if rows.is_empty() {
            return Ok(());
        }

        let mut encoder = StreamingParquetEncoder::create(&self.config.tmp_root)?;
        encoder.write_batch(&rows)?;
        let bytes = encoder.finish().await?;

        let wrote = self.cold.put(&path, &bytes, true).await?;
        if !wrote {
            tracing::debug!(site, %day, "backfill day already archived, left existing object in place");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::state_store::fake::FakeStateStore;

    fn test_config() -> LakeConfig {
        LakeConfig {
            database_url: String::new(),
            bind_host: "127.0.0.1".into(),
            bind_port: 0,
            hot_window_days: 20,
            processing_lag_seconds: 0,
            max_query_range_days: 365,
            sync_interval_seconds: 300,
            sync_lock_ttl_seconds: 900,
            archive_run_hour_utc: 2,
            backfill_max_days_per_invocation: 7,
            backfill_requests_per_minute: 30,
            backfill_max_range_days: 730,
            cold_fetch_concurrency: 4,
            cold_file_max_bytes: 1024 * 1024,
            allowed_origins: vec![],
            sites: vec!["example".into()],
            upstream_base_url: "http://upstream.invalid".into(),
            upstream_api_token: "token".into(),
            upstream_page_size: 1000,
            upstream_request_timeout_seconds: 5,
            backfill_bearer_token: "secret".into(),
            cold_root: "/tmp/cold".into(),
            tmp_root: "/tmp/lake-tmp".into(),
        }
    }

    #[tokio::test]
    async fn create_job_rejects_empty_range() {
        let state = FakeStateStore::default();
        let config = test_config();
        let start = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let err = create_job(&state, &config, "example", start, start, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LakeError::Validation(_)));
    }

    #[tokio::test]
    async fn create_job_rejects_range_over_configured_maximum() {
        let state = FakeStateStore::default();
        let mut config = test_config();
        config.backfill_max_range_days = 30;
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = start + chrono::Duration::days(400);
        let err = create_job(&state, &config, "example", start, end, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LakeError::Validation(_)));
    }

    #[tokio::test]
    async fn create_job_rejects_a_second_in_progress_job_for_the_same_site() {
        let state = FakeStateStore::default();
        let config = test_config();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        create_job(&state, &config, "example", start, end, false, false)
            .await
            .unwrap();

        let other_start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let other_end = NaiveDate::from_ymd_opt(2024, 2, 5).unwrap();
        let err = create_job(&state, &config, "example", other_start, other_end, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LakeError::Validation(_)));
    }

    #[tokio::test]
    async fn resume_reuses_completed_days_of_a_cancelled_job() {
        let state = FakeStateStore::default();
        let config = test_config();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let job_id = create_job(&state, &config, "example", start, end, false, false)
            .await
            .unwrap();

        let (value, version) = state.get(&job_key(&job_id)).await.unwrap().unwrap();
        let mut job = BackfillJob::from_value(value).unwrap();
        job.completed_days.insert(start);
        job.completed_days.insert(start + chrono::Duration::days(1));
        job.status = BackfillStatus::Cancelled;
        state
            .compare_and_swap(&job_key(&job_id), Some(version), &job.to_value())
            .await
            .unwrap();

        let resumed_id = create_job(&state, &config, "example", start, end, true, false)
            .await
            .unwrap();
        assert_eq!(resumed_id, job_id);

        let resumed_job = load_job(&state, &resumed_id).await.unwrap().unwrap();
        assert_eq!(resumed_job.status, BackfillStatus::Queued);
        assert_eq!(resumed_job.completed_days.len(), 2);
    }

    #[tokio::test]
    async fn cancel_job_transitions_queued_job_to_cancelled() {
        let state = FakeStateStore::default();
        let config = test_config();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let job_id = create_job(&state, &config, "example", start, end, false, false)
            .await
            .unwrap();

        let cancelled = cancel_job(&state, &job_id).await.unwrap();
        assert!(cancelled);

        let job = load_job(&state, &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, BackfillStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_job_is_a_no_op_for_unknown_job() {
        let state = FakeStateStore::default();
        assert!(!cancel_job(&state, "missing").await.unwrap());
    }
}
