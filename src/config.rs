use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u16(key: &str, default: u16) -> Result<u16> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Every tunable of the lake in one place, loaded once at process start.
/// No component reaches into the environment directly after this.
#[derive(Debug, Clone)]
pub struct LakeConfig {
    pub database_url: String,
    pub bind_host: String,
    pub bind_port: u16,

    /// Boundary between hot and cold tiers, in days. Also the archival
    /// worker's "strictly older than" threshold — there is exactly one
    /// field so the two can never disagree.
    pub hot_window_days: u32,
    /// Subtracted from `now` when computing the sync window's upper bound.
    pub processing_lag_seconds: u64,
    pub max_query_range_days: u32,

    pub sync_interval_seconds: u64,
    pub sync_lock_ttl_seconds: u64,
    /// Hour of day (UTC) at which the archival worker's daily tick fires.
    pub archive_run_hour_utc: u32,

    pub backfill_max_days_per_invocation: u32,
    pub backfill_requests_per_minute: u32,
    /// Largest `[start_day, end_day)` span a single backfill job may cover.
    pub backfill_max_range_days: u32,

    pub cold_fetch_concurrency: usize,
    pub cold_file_max_bytes: u64,

    pub allowed_origins: Vec<String>,

    pub sites: Vec<String>,

    pub upstream_base_url: String,
    pub upstream_api_token: String,
    pub upstream_page_size: u32,
    pub upstream_request_timeout_seconds: u64,

    pub backfill_bearer_token: String,

    pub cold_root: PathBuf,
    pub tmp_root: PathBuf,
}

impl LakeConfig {
    pub fn from_env() -> Result<Self> {
        let hot_window_days = env_u32("HOT_WINDOW_DAYS", 20)?;
        if let Some(raw) = env_optional_string("ARCHIVE_THRESHOLD_DAYS") {
            let archive_threshold_days: u32 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid ARCHIVE_THRESHOLD_DAYS: {raw}"))?;
            if archive_threshold_days != hot_window_days {
                bail!(
                    "HOT_WINDOW_DAYS ({hot_window_days}) and ARCHIVE_THRESHOLD_DAYS \
                     ({archive_threshold_days}) must be the same value"
                );
            }
        }

        let cold_root = env_path("COLD_STORE_ROOT", "./data/cold");
        let tmp_root = env_path("LAKE_TMP_ROOT", "./data/tmp");

        let config = Self {
            database_url: env_string("DATABASE_URL", "postgres://localhost/vitalslake"),
            bind_host: env_string("BIND_HOST", "127.0.0.1"),
            bind_port: env_u16("BIND_PORT", 8080)?,

            hot_window_days,
            processing_lag_seconds: env_u64("PROCESSING_LAG_SECONDS", 0)?,
            max_query_range_days: env_u32("MAX_QUERY_RANGE_DAYS", 365)?,

            sync_interval_seconds: env_u64("SYNC_INTERVAL_SECONDS", 300)?,
            sync_lock_ttl_seconds: env_u64("SYNC_LOCK_TTL_SECONDS", 900)?,
            archive_run_hour_utc: env_u32("ARCHIVE_RUN_HOUR_UTC", 2)?,

            backfill_max_days_per_invocation: env_u32("BACKFILL_MAX_DAYS_PER_INVOCATION", 7)?,
            backfill_requests_per_minute: env_u32("BACKFILL_REQUESTS_PER_MINUTE", 30)?,
            backfill_max_range_days: env_u32("BACKFILL_MAX_RANGE_DAYS", 730)?,

            cold_fetch_concurrency: env_u32("COLD_FETCH_CONCURRENCY", 10)? as usize,
            cold_file_max_bytes: env_u64("COLD_FILE_MAX_BYTES", 200 * 1024 * 1024)?,

            allowed_origins: env_list("ALLOWED_ORIGINS", &[]),

            sites: env_list("LAKE_SITES", &[]),

            upstream_base_url: env_string("UPSTREAM_BASE_URL", "https://api.vendor.example.com"),
            upstream_api_token: env_optional_string("UPSTREAM_API_TOKEN").unwrap_or_default(),
            upstream_page_size: env_u32("UPSTREAM_PAGE_SIZE", 5000)?,
            upstream_request_timeout_seconds: env_u64("UPSTREAM_REQUEST_TIMEOUT_SECONDS", 30)?,

            backfill_bearer_token: env_optional_string("BACKFILL_BEARER_TOKEN")
                .unwrap_or_default(),

            cold_root,
            tmp_root,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hot_window_days == 0 {
            bail!("HOT_WINDOW_DAYS must be non-zero");
        }
        if self.sync_interval_seconds == 0 {
            bail!("SYNC_INTERVAL_SECONDS must be non-zero");
        }
        if self.backfill_max_days_per_invocation == 0 {
            bail!("BACKFILL_MAX_DAYS_PER_INVOCATION must be non-zero");
        }
        if self.cold_fetch_concurrency == 0 {
            bail!("COLD_FETCH_CONCURRENCY must be non-zero");
        }
        if self.archive_run_hour_utc > 23 {
            bail!("ARCHIVE_RUN_HOUR_UTC must be in 0..=23");
        }
        Ok(())
    }

    pub fn cold_partition_relative_path(&self, site: &str, day: chrono::NaiveDate) -> PathBuf {
        use chrono::Datelike;
        Path::new("timeseries")
            .join(site)
            .join(format!("{:04}", day.year()))
            .join(format!("{:02}", day.month()))
            .join(format!("{:02}.parquet", day.day()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in ["HOT_WINDOW_DAYS", "ARCHIVE_THRESHOLD_DAYS", "SYNC_INTERVAL_SECONDS"] {
            env::remove_var(key);
        }
    }

    #[test]
    fn rejects_disagreeing_hot_window_and_archive_threshold() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("HOT_WINDOW_DAYS", "20");
        env::set_var("ARCHIVE_THRESHOLD_DAYS", "30");
        let err = LakeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("must be the same value"));
        clear_env();
    }

    #[test]
    fn accepts_agreeing_hot_window_and_archive_threshold() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("HOT_WINDOW_DAYS", "20");
        env::set_var("ARCHIVE_THRESHOLD_DAYS", "20");
        let config = LakeConfig::from_env().expect("config should load");
        assert_eq!(config.hot_window_days, 20);
        clear_env();
    }

    #[test]
    fn cold_partition_path_matches_canonical_layout() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = LakeConfig::from_env().expect("config should load");
        let day = chrono::NaiveDate::from_ymd_opt(2024, 10, 1).unwrap();
        let path = config.cold_partition_relative_path("example", day);
        assert_eq!(path, PathBuf::from("timeseries/example/2024/10/01.parquet"));
    }
}
