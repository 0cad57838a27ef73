use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::points;
use crate::store::hot::{HotRow, HotStore};
use crate::store::state_store::StateStore;
use crate::upstream::UpstreamClient;
use crate::workers::now_ms;

fn lock_key(site: &str) -> String {
    format!("lock/sync/{site}")
}

fn cursor_key(site: &str) -> String {
    format!("cursor/sync/{site}")
}

/// Keeps the hot store current for one site: loads the last-synced cursor,
/// pulls everything the upstream has produced since, upserts it, and
/// advances the cursor. Runs on a timer, one site at a time, guarded by an
/// advisory lock so a slow run never overlaps the next tick for the same
/// site.
pub struct SyncWorker<H: HotStore, S: StateStore> {
    site: String,
    pool: PgPool,
    hot: Arc<H>,
    state: Arc<S>,
    upstream: UpstreamClient,
    config: LakeConfig,
}

impl<H: HotStore, S: StateStore> SyncWorker<H, S> {
    pub fn new(
        site: String,
        pool: PgPool,
        hot: Arc<H>,
        state: Arc<S>,
        upstream: UpstreamClient,
        config: LakeConfig,
    ) -> Self {
        Self {
            site,
            pool,
            hot,
            state,
            upstream,
            config,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let interval = Duration::from_secs(self.config.sync_interval_seconds);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = self.run_once().await {
                    tracing::warn!(site = %self.site, error = %err, "sync run failed");
                }
            }
        });
    }

    async fn acquire_lock(&self) -> LakeResult<Option<String>> {
        let key = lock_key(&self.site);
        let holder = Uuid::new_v4().to_string();
        let now = now_ms();
        let ttl_ms = (self.config.sync_lock_ttl_seconds * 1000) as i64;

        match self.state.get(&key).await? {
            None => {
                let value = json!({ "holder": holder, "expires_at_ms": now + ttl_ms });
                if self.state.compare_and_swap(&key, None, &value).await? {
                    return Ok(Some(holder));
                }
                Ok(None)
            }
            Some((value, version)) => {
                let expires_at_ms = value.get("expires_at_ms").and_then(|v| v.as_i64()).unwrap_or(0);
                if expires_at_ms > now {
                    return Ok(None);
                }
                let next = json!({ "holder": holder, "expires_at_ms": now + ttl_ms });
                if self
                    .state
                    .compare_and_swap(&key, Some(version), &next)
                    .await?
                {
                    return Ok(Some(holder));
                }
                Ok(None)
            }
        }
    }

    async fn release_lock(&self) {
        let _ = self.state.delete(&lock_key(&self.site)).await;
    }

    async fn load_cursor(&self) -> LakeResult<i64> {
        match self.state.get(&cursor_key(&self.site)).await? {
            Some((value, _)) => Ok(value.get("cursor_ms").and_then(|v| v.as_i64()).unwrap_or(0)),
            None => {
                let window_ms = self.config.hot_window_days as i64 * 86_400_000;
                Ok(now_ms() - window_ms)
            }
        }
    }

    async fn advance_cursor(&self, cursor_ms: i64) -> LakeResult<()> {
        self.state
            .put(&cursor_key(&self.site), &json!({ "cursor_ms": cursor_ms }))
            .await?;
        Ok(())
    }

    pub async fn run_once(&self) -> LakeResult<u64> {
        let Some(_holder) = self.acquire_lock().await? else {
            tracing::debug!(site = %self.site, "sync lock held by another run, skipping");
            return Ok(0);
        };

        let result = self.sync_window().await;
        self.release_lock().await;
        result
    }

    async fn sync_window(&self) -> LakeResult<u64> {
        let start_ms = self.load_cursor().await?;
        let end_ms = now_ms() - (self.config.processing_lag_seconds * 1000) as i64;
        if end_ms <= start_ms {
            tracing::debug!(site = %self.site, start_ms, end_ms, "sync window is empty, nothing to do");
            return Ok(0);
        }

        let configured = self.upstream.fetch_configured_points(&self.site).await?;
        let batch: Vec<(String, Option<String>)> = configured
            .iter()
            .map(|p| (p.name.clone(), p.display_name.clone()))
            .collect();
        let point_ids = points::ensure_points_batch(&self.pool, &self.site, &batch).await?;

        let samples = self
            .upstream
            .fetch_timeseries_window(&self.site, start_ms, end_ms)
            .await?;

        let mut rows = Vec::with_capacity(samples.len());
        for sample in &samples {
            let Some(value) = sample.value else { continue };
            let Some(&point_id) = point_ids.get(&sample.name) else {
                tracing::warn!(site = %self.site, point = %sample.name, "sample for unconfigured point, skipping");
                continue;
            };
            rows.push(HotRow {
                point_id,
                timestamp_ms: sample.time.timestamp_millis(),
                value,
            });
        }

        let written = self.hot.upsert_batch(&rows).await.map_err(|err| {
            LakeError::HotStore(format!("sync upsert for site {}: {err}", self.site))
        })?;

        self.advance_cursor(end_ms).await?;
        tracing::info!(site = %self.site, rows = written, start_ms, end_ms, "sync run complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hot::fake::FakeHotStore;
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
    async fn lock_guards_against_concurrent_runs_for_the_same_site() {
        let state = Arc::new(FakeStateStore::default());
        let hot = Arc::new(FakeHotStore::default());
        let config = test_config();
        let upstream = UpstreamClient::new(&config).unwrap();
        let worker = SyncWorker::new(
            "example".into(),
            PgPool::connect_lazy("postgres://unused/unused").unwrap(),
            hot,
            state.clone(),
            upstream,
            config,
        );

        let first = worker.acquire_lock().await.unwrap();
        assert!(first.is_some());
        let second = worker.acquire_lock().await.unwrap();
        assert!(second.is_none(), "second lock attempt should be blocked while first holds it");
        worker.release_lock().await;
        let third = worker.acquire_lock().await.unwrap();
        assert!(third.is_some(), "lock should be acquirable again after release");
    }

    #[tokio::test]
    async fn empty_window_is_a_no_op() {
        let state = Arc::new(FakeStateStore::default());
        let hot = Arc::new(FakeHotStore::default());
        let config = test_config();
        let upstream = UpstreamClient::new(&config).unwrap();
        state
            .put(&cursor_key("example"), &json!({ "cursor_ms": now_ms() + 60_000 }))
            .await
            .unwrap();
        let worker = SyncWorker::new(
            "example".into(),
            PgPool::connect_lazy("postgres://unused/unused").unwrap(),
            hot,
            state,
            upstream,
            config,
        );
        let written = worker.sync_window().await.unwrap();
        assert_eq!(written, 0);
    }
}
