use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::codec::decode_bytes;
use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::ids::cache_key;
use crate::points;
use crate::store::cold::ColdStore;
use crate::store::hot::HotStore;
use crate::store::state_store::StateStore;

/// Caps the number of series a single request may ask for.
const MAX_QUERY_SERIES: usize = 200;
const HOT_QUERY_BATCH_SIZE: i64 = 5000;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    Min,
    Max,
    Last,
}

#[derive(Debug, Clone, Deserialize, Serialize, utoipa::ToSchema)]
pub struct AggregationSpec {
    /// Bucket width in seconds. Each bucket covers
    /// `[floor(t/w)*w, floor(t/w)*w + w)`.
    pub window_seconds: i64,
    pub reducer: Aggregation,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct QueryRequest {
    pub site: String,
    pub point_names: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub aggregation: Option<AggregationSpec>,
}

/// One merged, deduplicated sample. Internal to query assembly; never
/// serialized directly to a client (the response groups these into
/// per-point `SeriesEntry` arrays).
#[derive(Debug, Clone)]
struct Sample {
    point: String,
    timestamp: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SeriesEntry {
    pub name: String,
    /// `[timestamp_ms, value]` pairs, ascending, deduplicated.
    #[schema(value_type = Vec<Vec<f64>>)]
    pub data: Vec<(i64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RangeInfo {
    pub start: i64,
    pub end: i64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ColdRangeInfo {
    pub start: i64,
    pub end: i64,
    pub file_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct QueryMetadata {
    /// Which tiers were consulted to answer this query, in the order they
    /// were read: `["cold"]`, `["hot"]`, or `["cold", "hot"]` for a split.
    pub sources: Vec<String>,
    #[serde(default)]
    pub hot_range: Option<RangeInfo>,
    #[serde(default)]
    pub cold_range: Option<ColdRangeInfo>,
    pub query_time_ms: u64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct QueryResponse {
    pub series: Vec<SeriesEntry>,
    pub metadata: QueryMetadata,
}

/// How long a cached answer stays valid, keyed on how far in the past the
/// window ends: older windows are effectively immutable (sync/archival
/// won't touch them again), so they can sit in cache far longer.
fn cache_ttl_seconds(end: DateTime<Utc>) -> u64 {
    let age = Utc::now() - end;
    if age < chrono::Duration::days(1) {
        300
    } else if age < chrono::Duration::days(7) {
        1800
    } else if age < chrono::Duration::days(30) {
        3600
    } else {
        86_400
    }
}

fn bucket_start_ms(timestamp_ms: i64, window_ms: i64) -> i64 {
    timestamp_ms.div_euclid(window_ms) * window_ms
}

/// Post-merge windowing pass: buckets by `floor(t/w)*w` and reduces each
/// bucket by the requested statistic. Runs after dedup, so each input
/// sample is counted at most once.
fn aggregate(samples: &[Sample], spec: &AggregationSpec) -> Vec<(i64, f64)> {
    let window_ms = (spec.window_seconds.max(1)) * 1000;
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        let bucket = bucket_start_ms(sample.timestamp.timestamp_millis(), window_ms);
        buckets.entry(bucket).or_default().push(sample.value);
    }
    buckets
        .into_iter()
        .map(|(bucket, values)| {
            let reduced = match spec.reducer {
                Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
                Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                // `values` was built in ascending timestamp order, so the
                // last entry pushed is the last sample in the bucket.
                Aggregation::Last => *values.last().expect("bucket always has >=1 value"),
            };
            (bucket, reduced)
        })
        .collect()
}

pub struct QueryWorker<H: HotStore, C: ColdStore, S: StateStore> {
    pool: PgPool,
    hot: Arc<H>,
    cold: Arc<C>,
    state: Arc<S>,
    config: LakeConfig,
}

impl<H: HotStore, C: ColdStore, S: StateStore> QueryWorker<H, C, S> {
    pub fn new(pool: PgPool, hot: Arc<H>, cold: Arc<C>, state: Arc<S>, config: LakeConfig) -> Self {
        Self {
            pool,
            hot,
            cold,
            state,
            config,
        }
    }

    fn validate(&self, req: &QueryRequest) -> LakeResult<()> {
        if req.point_names.is_empty() {
            return Err(LakeError::Validation("point_names must not be empty".to_string()));
        }
        if req.point_names.len() > MAX_QUERY_SERIES {
            return Err(LakeError::Validation(format!(
                "point_names has {} entries, exceeds max of {MAX_QUERY_SERIES}",
                req.point_names.len()
            )));
        }
        if req.end_time <= req.start_time {
            return Err(LakeError::Validation("end_time must be after start_time".to_string()));
        }
        let span_days = (req.end_time - req.start_time).num_days().max(1) as u32;
        if span_days > self.config.max_query_range_days {
            return Err(LakeError::Validation(format!(
                "query range spans {span_days} days, exceeds max of {}",
                self.config.max_query_range_days
            )));
        }
        Ok(())
    }

    fn normalized_key(&self, req: &QueryRequest) -> String {
        let mut point_names = req.point_names.clone();
        point_names.sort();
        let agg = match &req.aggregation {
            Some(spec) => format!("{:?}:{}", spec.reducer, spec.window_seconds),
            None => "none".to_string(),
        };
        format!(
            "site={}|points={}|start={}|end={}|agg={}",
            req.site,
            point_names.join(","),
            req.start_time.timestamp_millis(),
            req.end_time.timestamp_millis(),
            agg
        )
    }

    async fn cache_get(&self, key: &str) -> Option<QueryResponse> {
        let value = match self.state.get(&format!("query_cache/{key}")).await {
            Ok(Some((value, _))) => value,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(error = %err, "query cache read failed, treating as miss");
                return None;
            }
        };
        let expires_at_ms = value.get("expires_at_ms").and_then(|v| v.as_i64()).unwrap_or(0);
        if expires_at_ms <= Utc::now().timestamp_millis() {
            return None;
        }
        let series: Vec<SeriesEntry> = serde_json::from_value(value.get("series")?.clone()).ok()?;
        let metadata: QueryMetadata = serde_json::from_value(value.get("metadata")?.clone()).ok()?;
        Some(QueryResponse { series, metadata })
    }

    async fn cache_put(&self, key: &str, response: &QueryResponse, end: DateTime<Utc>) {
        let ttl = cache_ttl_seconds(end);
        let value = json!({
            "series": response.series,
            "metadata": response.metadata,
            "expires_at_ms": Utc::now().timestamp_millis() + (ttl as i64 * 1000),
        });
        if let Err(err) = self.state.put(&format!("query_cache/{key}"), &value).await {
            tracing::warn!(error = %err, "query cache write failed, continuing without cache");
        }
    }

    pub async fn run(&self, req: QueryRequest) -> LakeResult<QueryResponse> {
        let started = std::time::Instant::now();
        self.validate(&req)?;

        let cache_key_value = cache_key(&self.normalized_key(&req));
        if let Some(mut cached) = self.cache_get(&cache_key_value).await {
            cached.metadata.cache_hit = true;
            return Ok(cached);
        }

        let hot_boundary = Utc::now() - chrono::Duration::days(self.config.hot_window_days as i64);

        let point_ids = points::resolve_point_ids(&self.pool, &req.site, &req.point_names).await?;
        let names_by_id: BTreeMap<i64, String> =
            point_ids.iter().map(|(name, id)| (*id, name.clone())).collect();
        let ids: Vec<i64> = point_ids.values().copied().collect();

        let mut sources = Vec::new();
        let mut cold_range = None;
        let mut cold_samples = Vec::new();
        if req.start_time < hot_boundary {
            let cold_end = req.end_time.min(hot_boundary);
            let (samples, file_count) = self
                .read_cold(&req.site, &req.point_names, req.start_time, cold_end)
                .await?;
            sources.push("cold".to_string());
            cold_range = Some(ColdRangeInfo {
                start: req.start_time.timestamp_millis(),
                end: cold_end.timestamp_millis(),
                file_count,
            });
            cold_samples = samples;
        }

        let mut hot_range = None;
        let mut hot_samples = Vec::new();
        if req.end_time > hot_boundary {
            let hot_start = req.start_time.max(hot_boundary);
            hot_samples = self.read_hot(&ids, &names_by_id, hot_start, req.end_time).await?;
            sources.push("hot".to_string());
            hot_range = Some(RangeInfo {
                start: hot_start.timestamp_millis(),
                end: req.end_time.timestamp_millis(),
                sample_count: hot_samples.len() as u64,
            });
        }

        // Cold is inserted first so hot overwrites it on an exact
        // (point, timestamp) collision at the boundary.
        let mut dedup: BTreeMap<(String, i64), f64> = BTreeMap::new();
        for sample in &cold_samples {
            dedup.insert((sample.point.clone(), sample.timestamp.timestamp_millis()), sample.value);
        }
        for sample in &hot_samples {
            dedup.insert((sample.point.clone(), sample.timestamp.timestamp_millis()), sample.value);
        }

        let mut by_point: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
        for ((point, ts_ms), value) in dedup {
            by_point.entry(point.clone()).or_default().push(Sample {
                point,
                timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap_or(req.start_time),
                value,
            });
        }

        let series: Vec<SeriesEntry> = req
            .point_names
            .iter()
            .map(|name| {
                let mut samples = by_point.remove(name).unwrap_or_default();
                samples.sort_by_key(|s| s.timestamp);
                let data = match &req.aggregation {
                    Some(spec) => aggregate(&samples, spec),
                    None => samples
                        .iter()
                        .map(|s| (s.timestamp.timestamp_millis(), s.value))
                        .collect(),
                };
                SeriesEntry {
                    name: name.clone(),
                    data,
                }
            })
            .collect();

        let response = QueryResponse {
            series,
            metadata: QueryMetadata {
                sources,
                hot_range,
                cold_range,
                query_time_ms: started.elapsed().as_millis() as u64,
                cache_hit: false,
            },
        };
        self.cache_put(&cache_key_value, &response, req.end_time).await;
        Ok(response)
    }

    async fn read_hot(
        &self,
        ids: &[i64],
        names_by_id: &BTreeMap<i64, String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LakeResult<Vec<Sample>> {
        let mut out = Vec::new();
        let mut after = None;
        loop {
            let batch = self
                .hot
                .query_range_batch(
                    ids,
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                    after,
                    HOT_QUERY_BATCH_SIZE,
                )
                .await
                .map_err(|err| LakeError::HotStore(format!("query read: {err}")))?;
            if batch.is_empty() {
                break;
            }
            let is_short = (batch.len() as i64) < HOT_QUERY_BATCH_SIZE;
            for row in &batch {
                if let Some(name) = names_by_id.get(&row.point_id) {
                    out.push(Sample {
                        point: name.clone(),
                        timestamp: DateTime::from_timestamp_millis(row.timestamp_ms)
                            .unwrap_or(start),
                        value: row.value,
                    });
                }
            }
            let last = batch.last().unwrap();
            after = Some((last.timestamp_ms, last.point_id));
            if is_short {
                break;
            }
        }
        Ok(out)
    }

    /// Returns the merged samples in `[start, end)` plus the number of
    /// daily cold partitions consulted to produce them.
    async fn read_cold(
        &self,
        site: &str,
        wanted_points: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LakeResult<(Vec<Sample>, u64)> {
        let wanted: std::collections::HashSet<&str> = wanted_points.iter().map(String::as_str).collect();
        let mut day = start.date_naive();
        let last_day = end.date_naive();
        let mut paths = Vec::new();
        while day <= last_day {
            paths.push(self.config.cold_partition_relative_path(site, day));
            day += chrono::Duration::days(1);
        }
        let file_count = paths.len() as u64;

        let semaphore = Arc::new(Semaphore::new(self.config.cold_fetch_concurrency));
        let mut tasks = FuturesUnordered::new();
        for path in paths {
            let cold = Arc::clone(&self.cold);
            let semaphore = Arc::clone(&semaphore);
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let path_str = path.to_string_lossy().replace('\\', "/");
                cold.get(&path_str).await
            });
        }

        let mut samples = Vec::new();
        while let Some(result) = tasks.next().await {
            let Some(bytes) = result? else { continue };
            let rows = decode_bytes(&bytes).await?;
            for row in rows {
                let ts = DateTime::from_timestamp_millis(row.timestamp_ms).unwrap_or(start);
                if ts < start || ts >= end {
                    continue;
                }
                if !wanted.contains(row.point_name.as_str()) {
                    continue;
                }
                samples.push(Sample {
                    point: row.point_name,
                    timestamp: ts,
                    value: row.value,
                });
            }
        }
        Ok((samples, file_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_point_list() {
        let req = QueryRequest {
            site: "example".into(),
            point_names: vec![],
            start_time: Utc::now(),
            end_time: Utc::now() + chrono::Duration::hours(1),
            aggregation: None,
        };
        let config = test_config();
        let worker = QueryWorker::<
            crate::store::hot::fake::FakeHotStore,
            crate::store::cold::FsColdStore,
            crate::store::state_store::fake::FakeStateStore,
        >::new(
            PgPool::connect_lazy("postgres://unused/unused").unwrap(),
            Arc::new(crate::store::hot::fake::FakeHotStore::default()),
            Arc::new(crate::store::cold::FsColdStore::new("/tmp/a".into(), "/tmp/b".into(), 1024)),
            Arc::new(crate::store::state_store::fake::FakeStateStore::default()),
            config,
        );
        assert!(worker.validate(&req).is_err());
    }

    #[test]
    fn validate_rejects_end_before_start() {
        let req = QueryRequest {
            site: "example".into(),
            point_names: vec!["p1".into()],
            start_time: Utc::now(),
            end_time: Utc::now() - chrono::Duration::hours(1),
            aggregation: None,
        };
        let config = test_config();
        let worker = QueryWorker::<
            crate::store::hot::fake::FakeHotStore,
            crate::store::cold::FsColdStore,
            crate::store::state_store::fake::FakeStateStore,
        >::new(
            PgPool::connect_lazy("postgres://unused/unused").unwrap(),
            Arc::new(crate::store::hot::fake::FakeHotStore::default()),
            Arc::new(crate::store::cold::FsColdStore::new("/tmp/a".into(), "/tmp/b".into(), 1024)),
            Arc::new(crate::store::state_store::fake::FakeStateStore::default()),
            config,
        );
        assert!(worker.validate(&req).is_err());
    }

    #[test]
    fn cache_ttl_is_longest_for_windows_well_in_the_past() {
        let old_end = Utc::now() - chrono::Duration::days(45);
        assert_eq!(cache_ttl_seconds(old_end), 86_400);
    }

    #[test]
    fn cache_ttl_is_shortest_for_a_window_ending_now() {
        assert_eq!(cache_ttl_seconds(Utc::now()), 300);
    }

    #[test]
    fn aggregate_mean_buckets_by_window_and_averages() {
        let samples = vec![
            Sample { point: "p1".into(), timestamp: DateTime::from_timestamp_millis(0).unwrap(), value: 1.0 },
            Sample { point: "p1".into(), timestamp: DateTime::from_timestamp_millis(30_000).unwrap(), value: 3.0 },
            Sample { point: "p1".into(), timestamp: DateTime::from_timestamp_millis(70_000).unwrap(), value: 10.0 },
        ];
        let spec = AggregationSpec { window_seconds: 60, reducer: Aggregation::Mean };
        let buckets = aggregate(&samples, &spec);
        assert_eq!(buckets, vec![(0, 2.0), (60_000, 10.0)]);
    }

    #[test]
    fn aggregate_last_takes_the_latest_sample_in_each_bucket() {
        let samples = vec![
            Sample { point: "p1".into(), timestamp: DateTime::from_timestamp_millis(0).unwrap(), value: 1.0 },
            Sample { point: "p1".into(), timestamp: DateTime::from_timestamp_millis(30_000).unwrap(), value: 3.0 },
        ];
        let spec = AggregationSpec { window_seconds: 60, reducer: Aggregation::Last };
        let buckets = aggregate(&samples, &spec);
        assert_eq!(buckets, vec![(0, 3.0)]);
    }

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
}
