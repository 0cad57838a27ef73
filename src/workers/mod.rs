pub mod archival;
pub mod backfill;
pub mod query;
pub mod sync;

use chrono::Utc;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
