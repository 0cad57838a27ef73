use serde_json::Value;
use sqlx::PgPool;

use crate::error::LakeResult;

/// Get/put/compare-and-swap/delete/list over small, independent keys: sync
/// cursors, advisory locks, archive state, backfill job records, query
/// cache entries. Last-writer-wins is fine for cache and metrics; lock and
/// job records always go through `compare_and_swap`.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> impl std::future::Future<Output = LakeResult<Option<(Value, i64)>>> + Send;

    /// Unconditional upsert. Returns the new version.
    fn put(&self, key: &str, value: &Value) -> impl std::future::Future<Output = LakeResult<i64>> + Send;

    /// `expected_version = None` requires the key to be absent (fresh
    /// insert); `Some(v)` requires the current version to equal `v`.
    /// Returns whether the swap succeeded.
    fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<i64>,
        value: &Value,
    ) -> impl std::future::Future<Output = LakeResult<bool>> + Send;

    fn delete(&self, key: &str) -> impl std::future::Future<Output = LakeResult<()>> + Send;

    fn list_prefix(&self, prefix: &str) -> impl std::future::Future<Output = LakeResult<Vec<String>>> + Send;
}

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> LakeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_entries (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl StateStore for PostgresStateStore {
    async fn get(&self, key: &str) -> LakeResult<Option<(Value, i64)>> {
        let row: Option<(Value, i64)> =
            sqlx::query_as("SELECT value, version FROM state_entries WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn put(&self, key: &str, value: &Value) -> LakeResult<i64> {
        let (version,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO state_entries (key, value, version)
            VALUES ($1, $2, 1)
            ON CONFLICT (key) DO UPDATE
                SET value = excluded.value,
                    version = state_entries.version + 1,
                    updated_at = now()
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<i64>,
        value: &Value,
    ) -> LakeResult<bool> {
        match expected_version {
            None => {
                let row: Option<(i64,)> = sqlx::query_as(
                    r#"
                    INSERT INTO state_entries (key, value, version)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (key) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(value)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.is_some())
            }
            Some(expected) => {
                let row: Option<(i64,)> = sqlx::query_as(
                    r#"
                    UPDATE state_entries
                    SET value = $2, version = version + 1, updated_at = now()
                    WHERE key = $1 AND version = $3
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expected)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.is_some())
            }
        }
    }

    async fn delete(&self, key: &str) -> LakeResult<()> {
        sqlx::query("DELETE FROM state_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> LakeResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM state_entries WHERE key LIKE $1 || '%'")
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeStateStore {
        entries: Mutex<HashMap<String, (Value, i64)>>,
    }

    impl StateStore for FakeStateStore {
        async fn get(&self, key: &str) -> LakeResult<Option<(Value, i64)>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn put(&self, key: &str, value: &Value) -> LakeResult<i64> {
            let mut guard = self.entries.lock().unwrap();
            let version = guard.get(key).map(|(_, v)| v + 1).unwrap_or(1);
            guard.insert(key.to_string(), (value.clone(), version));
            Ok(version)
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_version: Option<i64>,
            value: &Value,
        ) -> LakeResult<bool> {
            let mut guard = self.entries.lock().unwrap();
            let current_version = guard.get(key).map(|(_, v)| *v);
            if current_version != expected_version {
                return Ok(false);
            }
            let next_version = expected_version.unwrap_or(0) + 1;
            guard.insert(key.to_string(), (value.clone(), next_version));
            Ok(true)
        }

        async fn delete(&self, key: &str) -> LakeResult<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn list_prefix(&self, prefix: &str) -> LakeResult<Vec<String>> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn compare_and_swap_requires_absence_for_initial_insert() {
        let store = FakeStateStore::default();
        let ok = store
            .compare_and_swap("lock:site-a", None, &serde_json::json!({"holder": "x"}))
            .await
            .unwrap();
        assert!(ok);
        let blocked = store
            .compare_and_swap("lock:site-a", None, &serde_json::json!({"holder": "y"}))
            .await
            .unwrap();
        assert!(!blocked);
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_version() {
        let store = FakeStateStore::default();
        store.put("job:1", &serde_json::json!({"status": "queued"})).await.unwrap();
        let (_, version) = store.get("job:1").await.unwrap().unwrap();
        let ok = store
            .compare_and_swap("job:1", Some(version), &serde_json::json!({"status": "in_progress"}))
            .await
            .unwrap();
        assert!(ok);
        let stale = store
            .compare_and_swap("job:1", Some(version), &serde_json::json!({"status": "cancelled"}))
            .await
            .unwrap();
        assert!(!stale);
    }
}
