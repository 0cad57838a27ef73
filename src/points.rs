use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::LakeResult;

#[derive(Debug, Clone)]
pub struct Point {
    pub id: i64,
    pub site_name: String,
    pub name: String,
    pub display_name: Option<String>,
}

pub async fn ensure_schema(pool: &PgPool) -> LakeResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS points (
            id BIGSERIAL PRIMARY KEY,
            site_name TEXT NOT NULL,
            name TEXT NOT NULL,
            display_name TEXT,
            data_type TEXT NOT NULL DEFAULT 'analog',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (site_name, name)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Creates a point on first sight or is a no-op for one already known.
/// `(site_name, name)` is the uniqueness key; the surrogate `id` never
/// changes once assigned.
pub async fn ensure_point(
    pool: &PgPool,
    site_name: &str,
    name: &str,
    display_name: Option<&str>,
) -> LakeResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO points (site_name, name, display_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (site_name, name) DO UPDATE
            SET display_name = COALESCE(excluded.display_name, points.display_name),
                updated_at = now()
        RETURNING id
        "#,
    )
    .bind(site_name)
    .bind(name)
    .bind(display_name)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Ensures every `(site_name, name)` pair exists and returns a name→id map
/// for the whole batch. Used by the sync worker against the upstream
/// configured-points list before ingest.
pub async fn ensure_points_batch(
    pool: &PgPool,
    site_name: &str,
    points: &[(String, Option<String>)],
) -> LakeResult<HashMap<String, i64>> {
    let mut ids = HashMap::with_capacity(points.len());
    for (name, display_name) in points {
        let id = ensure_point(pool, site_name, name, display_name.as_deref()).await?;
        ids.insert(name.clone(), id);
    }
    Ok(ids)
}

/// All points known for a site, for resolving `point_id -> name` during
/// archival encode.
pub async fn list_points_for_site(pool: &PgPool, site_name: &str) -> LakeResult<Vec<Point>> {
    let rows: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
        "SELECT id, site_name, name, display_name FROM points WHERE site_name = $1",
    )
    .bind(site_name)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, site_name, name, display_name)| Point {
            id,
            site_name,
            name,
            display_name,
        })
        .collect())
}

/// Resolves a subset of point names to ids, ignoring names that aren't
/// configured for the site.
pub async fn resolve_point_ids(
    pool: &PgPool,
    site_name: &str,
    names: &[String],
) -> LakeResult<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT name, id FROM points WHERE site_name = $1 AND name = ANY($2)",
    )
    .bind(site_name)
    .bind(names)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}
