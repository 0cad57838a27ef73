use sqlx::PgPool;

use crate::error::LakeResult;
use crate::retry::{retry, RetryPolicy};

/// One sample keyed on the hot store's primary key. Upsert-on-conflict
/// makes reingest of the same `(point_id, timestamp_ms)` idempotent.
#[derive(Debug, Clone, Copy)]
pub struct HotRow {
    pub point_id: i64,
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Range query, batch upsert, and range delete over the hot store. Backed
/// by Postgres here; workers depend on this trait, not the concrete store,
/// so tests can substitute an in-memory fake.
pub trait HotStore: Send + Sync {
    fn upsert_batch(
        &self,
        rows: &[HotRow],
    ) -> impl std::future::Future<Output = LakeResult<u64>> + Send;

    /// Keyset-paginated range scan ordered by `(timestamp_ms, point_id)`,
    /// resuming after `after`. Callers loop until a batch comes back
    /// shorter than `limit` instead of materializing the whole range —
    /// this is what keeps the archival worker's memory bounded on a
    /// tens-of-millions-row day.
    fn query_range_batch(
        &self,
        point_ids: &[i64],
        start_ms: i64,
        end_ms: i64,
        after: Option<(i64, i64)>,
        limit: i64,
    ) -> impl std::future::Future<Output = LakeResult<Vec<HotRow>>> + Send;

    fn delete_range(
        &self,
        point_ids: &[i64],
        start_ms: i64,
        end_ms: i64,
    ) -> impl std::future::Future<Output = LakeResult<u64>> + Send;
}

#[derive(Clone)]
pub struct PostgresHotStore {
    pool: PgPool,
}

impl PostgresHotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> LakeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS samples (
                point_id BIGINT NOT NULL,
                ts_ms BIGINT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                PRIMARY KEY (point_id, ts_ms)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Batches are capped to keep a single upsert statement well under
/// Postgres's bind-parameter limit (3 params/row here).
pub const UPSERT_BATCH_SIZE: usize = 1000;

impl HotStore for PostgresHotStore {
    async fn upsert_batch(&self, rows: &[HotRow]) -> LakeResult<u64> {
        let mut total = 0u64;
        for chunk in rows.chunks(UPSERT_BATCH_SIZE) {
            let policy = RetryPolicy::storage();
            let pool = self.pool.clone();
            let affected = retry(&policy, |_attempt| {
                let pool = pool.clone();
                async move {
                    let mut query_builder = sqlx::QueryBuilder::new(
                        "INSERT INTO samples (point_id, ts_ms, value) ",
                    );
                    query_builder.push_values(chunk, |mut b, row| {
                        b.push_bind(row.point_id)
                            .push_bind(row.timestamp_ms)
                            .push_bind(row.value);
                    });
                    query_builder.push(
                        " ON CONFLICT (point_id, ts_ms) DO UPDATE SET value = excluded.value",
                    );
                    query_builder
                        .build()
                        .execute(&pool)
                        .await
                        .map(|result| result.rows_affected())
                        .map_err(|err| crate::error::LakeError::HotStore(err.to_string()))
                }
            })
            .await?;
            total += affected;
        }
        Ok(total)
    }

    async fn query_range_batch(
        &self,
        point_ids: &[i64],
        start_ms: i64,
        end_ms: i64,
        after: Option<(i64, i64)>,
        limit: i64,
    ) -> LakeResult<Vec<HotRow>> {
        let (after_ts, after_point) = after.unwrap_or((i64::MIN, i64::MIN));
        let rows: Vec<(i64, i64, f64)> = sqlx::query_as(
            r#"
            SELECT point_id, ts_ms, value
            FROM samples
            WHERE point_id = ANY($1)
              AND ts_ms >= $2 AND ts_ms < $3
              AND (ts_ms, point_id) > ($4, $5)
            ORDER BY ts_ms, point_id
            LIMIT $6
            "#,
        )
        .bind(point_ids)
        .bind(start_ms)
        .bind(end_ms)
        .bind(after_ts)
        .bind(after_point)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| crate::error::LakeError::HotStore(err.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(point_id, timestamp_ms, value)| HotRow {
                point_id,
                timestamp_ms,
                value,
            })
            .collect())
    }

    async fn delete_range(&self, point_ids: &[i64], start_ms: i64, end_ms: i64) -> LakeResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM samples
            WHERE point_id = ANY($1) AND ts_ms >= $2 AND ts_ms < $3
            "#,
        )
        .bind(point_ids)
        .bind(start_ms)
        .bind(end_ms)
        .execute(&self.pool)
        .await
        .map_err(|err| crate::error::LakeError::HotStore(err.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory fake used by worker unit tests.
    #[derive(Default)]
    pub struct FakeHotStore {
        rows: Mutex<BTreeMap<(i64, i64), f64>>,
    }

    impl FakeHotStore {
        pub fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    impl HotStore for FakeHotStore {
        async fn upsert_batch(&self, rows: &[HotRow]) -> LakeResult<u64> {
            let mut guard = self.rows.lock().unwrap();
            for row in rows {
                guard.insert((row.point_id, row.timestamp_ms), row.value);
            }
            Ok(rows.len() as u64)
        }

        async fn query_range_batch(
            &self,
            point_ids: &[i64],
            start_ms: i64,
            end_ms: i64,
            after: Option<(i64, i64)>,
            limit: i64,
        ) -> LakeResult<Vec<HotRow>> {
            let guard = self.rows.lock().unwrap();
            let (after_ts, after_point) = after.unwrap_or((i64::MIN, i64::MIN));
            let mut matches: Vec<HotRow> = guard
                .iter()
                .filter(|((point_id, ts), _)| {
                    point_ids.contains(point_id)
                        && *ts >= start_ms
                        && *ts < end_ms
                        && (*ts, *point_id) > (after_ts, after_point)
                })
                .map(|((point_id, ts), value)| HotRow {
                    point_id: *point_id,
                    timestamp_ms: *ts,
                    value: *value,
                })
                .collect();
            matches.sort_by_key(|r| (r.timestamp_ms, r.point_id));
            matches.truncate(limit as usize);
            Ok(matches)
        }

        async fn delete_range(&self, point_ids: &[i64], start_ms: i64, end_ms: i64) -> LakeResult<u64> {
            let mut guard = self.rows.lock().unwrap();
            let keys: Vec<(i64, i64)> = guard
                .keys()
                .filter(|(point_id, ts)| {
                    point_ids.contains(point_id) && *ts >= start_ms && *ts < end_ms
                })
                .copied()
                .collect();
            let count = keys.len() as u64;
            for key in keys {
                guard.remove(&key);
            }
            Ok(count)
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_primary_key() {
        let store = FakeHotStore::default();
        let row = HotRow {
            point_id: 1,
            timestamp_ms: 1000,
            value: 1.0,
        };
        store.upsert_batch(&[row]).await.unwrap();
        store
            .upsert_batch(&[HotRow { value: 2.0, ..row }])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        let rows = store
            .query_range_batch(&[1], 0, 2000, None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 2.0);
    }

    #[tokio::test]
    async fn delete_range_only_removes_scoped_rows() {
        let store = FakeHotStore::default();
        store
            .upsert_batch(&[
                HotRow { point_id: 1, timestamp_ms: 100, value: 1.0 },
                HotRow { point_id: 1, timestamp_ms: 200, value: 2.0 },
                HotRow { point_id: 2, timestamp_ms: 100, value: 3.0 },
            ])
            .await
            .unwrap();
        let deleted = store.delete_range(&[1], 0, 150).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.len(), 2);
    }
}
