use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_bytes, EncodedRow, StreamingParquetEncoder};
use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::points;
use crate::store::cold::ColdStore;
use crate::store::hot::HotStore;
use crate::store::state_store::StateStore;

fn archive_cursor_key(site: &str) -> String {
    format!("archive_cursor/{site}")
}

const HOT_QUERY_BATCH_SIZE: i64 = 5000;

/// Moves data that has aged out of the hot window into cold storage, one
/// calendar day at a time. Runs once per day; catches up on a backlog of
/// unarchived days in a single invocation if the worker was down.
pub struct ArchivalWorker<H: HotStore, C: ColdStore, S: StateStore> {
    site: String,
    pool: PgPool,
    hot: Arc<H>,
    cold: Arc<C>,
    state: Arc<S>,
    config: LakeConfig,
}

impl<H: HotStore, C: ColdStore, S: StateStore> ArchivalWorker<H, C, S> {
    pub fn new(
        site: String,
        pool: PgPool,
        hot: Arc<H>,
        cold: Arc<C>,
        state: Arc<S>,
        config: LakeConfig,
    ) -> Self {
        Self {
            site,
            pool,
            hot,
            cold,
            state,
            config,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let sleep_for = self.seconds_until_next_run();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                if let Err(err) = self.run_once().await {
                    tracing::warn!(site = %self.site, error = %err, "archival run failed");
                }
            }
        });
    }

    fn seconds_until_next_run(&self) -> Duration {
        let now = Utc::now();
        let target_hour = self.config.archive_run_hour_utc;
        let mut next = now
            .date_naive()
            .and_hms_opt(target_hour, 0, 0)
            .expect("archive_run_hour_utc validated to be in 0..=23")
            .and_utc();
        if next <= now {
            next += chrono::Duration::days(1);
        }
        (next - now).to_std().unwrap_or(Duration::from_secs(60))
    }

    fn boundary_day(&self) -> NaiveDate {
        (Utc::now() - chrono::Duration::days(self.config.hot_window_days as i64)).date_naive()
    }

    async fn next_unarchived_day(&self) -> LakeResult<NaiveDate> {
        match self.state.get(&archive_cursor_key(&self.site)).await? {
            Some((value, _)) => {
                let raw = value
                    .get("next_day")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LakeError::Internal("archive cursor missing next_day".into()))?;
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|err| LakeError::Internal(format!("bad archive cursor date: {err}")))
            }
            None => Ok(self.boundary_day() - chrono::Duration::days(1)),
        }
    }

    async fn advance_cursor(&self, day: NaiveDate) -> LakeResult<()> {
        self.state
            .put(
                &archive_cursor_key(&self.site),
                &json!({ "next_day": day.format("%Y-%m-%d").to_string() }),
            )
            .await?;
        Ok(())
    }

    pub async fn run_once(&self) -> LakeResult<u32> {
        let boundary = self.boundary_day();
        let mut day = self.next_unarchived_day().await?;
        let mut archived = 0u32;

        while day < boundary {
            self.archive_day(day).await?;
            day += chrono::Duration::days(1);
            self.advance_cursor(day).await?;
            archived += 1;
        }
        Ok(archived)
    }

    fn day_bounds_ms(day: NaiveDate) -> (i64, i64) {
        let start = day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        let end = (day + chrono::Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        (start, end)
    }

    fn cold_path(&self, day: NaiveDate) -> String {
        self.config
            .cold_partition_relative_path(&self.site, day)
            .to_string_lossy()
            .replace('\\', "/")
    }

    async fn archive_day(&self, day: NaiveDate) -> LakeResult<()> {
        let path = self.cold_path(day);
        let points = points::list_points_for_site(&self.pool, &self.site).await?;
        if points.is_empty() {
            return Ok(());
        }
        let point_ids: Vec<i64> = points.iter().map(|p| p.id).collect();
        let names_by_id: std::collections::HashMap<i64, &str> =
            points.iter().map(|p| (p.id, p.name.as_str())).collect();
        let (start_ms, end_ms) = Self::day_bounds_ms(day);

        if self.cold.head(&path).await?.is_some() {
            // Cold object already exists (e.g. written by backfill). Don't
            // rewrite it, but hot rows for this day may still be lingering
            // from sync — delete them so a crash between write and delete
            // on a prior run, or a prior backfill, doesn't leave duplicates
            // sitting in the hot store forever.
            tracing::debug!(site = %self.site, %day, "day already archived, checking for lingering hot rows");
            let archived_rows = match self.cold.get(&path).await? {
                Some(bytes) => decode_bytes(&bytes).await?.len() as u64,
                None => 0,
            };
            let deleted = self.hot.delete_range(&point_ids, start_ms, end_ms).await?;
            if deleted > 0 {
                if archived_rows != 0 && deleted != archived_rows {
                    tracing::error!(
                        site = %self.site,
                        %day,
                        archived = archived_rows,
                        deleted,
                        "hot store row count did not match already-archived row count; hot/cold may now disagree"
                    );
                } else {
                    tracing::info!(site = %self.site, %day, deleted, "deleted lingering hot rows for already-archived day");
                }
            }
            return Ok(());
        }
        let mut encoder = StreamingParquetEncoder::create(&self.config.tmp_root)?;
        let mut after = None;
        let mut row_count: u64 = 0;

        loop {
            let batch = self
                .hot
                .query_range_batch(&point_ids, start_ms, end_ms, after, HOT_QUERY_BATCH_SIZE)
                .await
                .map_err(|err| LakeError::HotStore(format!("archival read for {path}: {err}")))?;
            if batch.is_empty() {
                break;
            }
            let encoded: Vec<EncodedRow> = batch
                .iter()
                .filter_map(|row| {
                    names_by_id.get(&row.point_id).map(|name| EncodedRow {
                        timestamp_ms: row.timestamp_ms,
                        point_name: name.to_string(),
                        value: row.value,
                    })
                })
                .collect();
            encoder.write_batch(&encoded)?;
            row_count += batch.len() as u64;
            let last = batch.last().unwrap();
            after = Some((last.timestamp_ms, last.point_id));
            if (batch.len() as i64) < HOT_QUERY_BATCH_SIZE {
                break;
            }
        }

        if row_count == 0 {
            tracing::debug!(site = %self.site, %day, "no rows for this day, nothing to archive");
            return Ok(());
        }

        let bytes = encoder.finish().await?;
        self.cold.put(&path, &bytes, false).await?;

        let stored_size = self
            .cold
            .head(&path)
            .await?
            .ok_or_else(|| LakeError::Integrity(format!("cold object missing immediately after put: {path}")))?;
        if stored_size as usize != bytes.len() {
            return Err(LakeError::Integrity(format!(
                "cold object size mismatch for {path}: wrote {} bytes, stored object is {stored_size} bytes",
                bytes.len()
            )));
        }

        let deleted = self.hot.delete_range(&point_ids, start_ms, end_ms).await?;
        if deleted != row_count {
            tracing::error!(
                site = %self.site,
                %day,
                archived = row_count,
                deleted,
                "hot store row count did not match archived row count; hot/cold may now disagree"
            );
        }

        tracing::info!(site = %self.site, %day, rows = row_count, "archived day to cold storage");
        Ok(())
    }
}
