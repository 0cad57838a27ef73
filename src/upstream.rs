use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::LakeConfig;
use crate::error::{LakeError, LakeResult};
use crate::retry::{retry, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct ConfiguredPointDto {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfiguredPointsPage {
    points: Vec<ConfiguredPointDto>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointSampleDto {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesPage {
    pub point_samples: Vec<PointSampleDto>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Thin client over the upstream vendor's paginated time-series API.
/// Every network call goes through `retry()`; callers never see a bare
/// transport error, only a classified `LakeError`.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    page_size: u32,
}

impl UpstreamClient {
    pub fn new(config: &LakeConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            token: config.upstream_api_token.clone(),
            page_size: config.upstream_page_size,
        })
    }

    fn classify(status: StatusCode, retry_after_header: Option<&str>) -> LakeError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_header.and_then(|v| v.trim().parse::<u64>().ok());
            return LakeError::RateLimited { retry_after };
        }
        if status.is_server_error() {
            return LakeError::UpstreamTransient(format!("upstream status {status}"));
        }
        LakeError::UpstreamRejected {
            status: status.as_u16(),
            message: format!("upstream rejected request with status {status}"),
        }
    }

    async fn get_configured_points_page(
        &self,
        site: &str,
        page: u32,
    ) -> LakeResult<ConfiguredPointsPage> {
        let url = format!("{}/sites/{site}/configured_points", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("page", page), ("per_page", self.page_size)])
            .header("authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|err| LakeError::UpstreamTransient(err.to_string()))?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(Self::classify(response.status(), retry_after.as_deref()));
        }

        response
            .json()
            .await
            .map_err(|err| LakeError::UpstreamTransient(format!("decode error: {err}")))
    }

    /// Fetch every configured point for `site`, paging until the upstream
    /// stops returning `has_more`.
    pub async fn fetch_configured_points(
        &self,
        site: &str,
    ) -> LakeResult<Vec<ConfiguredPointDto>> {
        let policy = RetryPolicy::upstream();
        let mut page = 1u32;
        let mut points = Vec::new();
        loop {
            let result = retry(&policy, |_attempt| self.get_configured_points_page(site, page))
                .await?;
            let has_more = result.has_more;
            points.extend(result.points);
            if !has_more {
                break;
            }
            page += 1;
        }
        Ok(points)
    }

    async fn get_timeseries_page(
        &self,
        site: &str,
        start_ms: i64,
        end_ms: i64,
        cursor: Option<&str>,
    ) -> LakeResult<TimeseriesPage> {
        let url = format!("{}/sites/{site}/timeseries/paginated", self.base_url);
        let mut query = vec![
            ("start_time".to_string(), start_ms.to_string()),
            ("end_time".to_string(), end_ms.to_string()),
            ("page_size".to_string(), self.page_size.to_string()),
            ("raw_data".to_string(), "true".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor".to_string(), cursor.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .header("authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|err| LakeError::UpstreamTransient(err.to_string()))?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(Self::classify(response.status(), retry_after.as_deref()));
        }

        response
            .json()
            .await
            .map_err(|err| LakeError::UpstreamTransient(format!("decode error: {err}")))
    }

    /// Fetch one page at a time through the configured retry policy. The
    /// caller drives pagination so a mid-stream cancellation (deadline,
    /// job cancel) can stop between pages without losing already-merged
    /// results.
    pub async fn fetch_timeseries_page(
        &self,
        site: &str,
        start_ms: i64,
        end_ms: i64,
        cursor: Option<&str>,
    ) -> LakeResult<TimeseriesPage> {
        let policy = RetryPolicy::upstream();
        retry(&policy, |_attempt| {
            self.get_timeseries_page(site, start_ms, end_ms, cursor)
        })
        .await
    }

    /// Fetch the full `[start_ms, end_ms)` window, merging every page.
    pub async fn fetch_timeseries_window(
        &self,
        site: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> LakeResult<Vec<PointSampleDto>> {
        let mut cursor: Option<String> = None;
        let mut samples = Vec::new();
        loop {
            let page = self
                .fetch_timeseries_page(site, start_ms, end_ms, cursor.as_deref())
                .await?;
            let has_more = page.has_more;
            let next_cursor = page.next_cursor;
            samples.extend(page.point_samples);
            if !has_more {
                break;
            }
            cursor = next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_rate_limited_with_retry_after() {
        let err = UpstreamClient::classify(StatusCode::TOO_MANY_REQUESTS, Some("2"));
        match err {
            LakeError::RateLimited { retry_after } => assert_eq!(retry_after, Some(2)),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classifies_5xx_as_transient() {
        let err = UpstreamClient::classify(StatusCode::BAD_GATEWAY, None);
        assert!(err.retryable());
    }

    #[test]
    fn classifies_other_4xx_as_rejected_and_not_retryable() {
        let err = UpstreamClient::classify(StatusCode::FORBIDDEN, None);
        assert!(!err.retryable());
        assert!(matches!(err, LakeError::UpstreamRejected { status: 403, .. }));
    }
}
