use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::config::LakeConfig;
use crate::store::cold::FsColdStore;
use crate::store::hot::PostgresHotStore;
use crate::store::state_store::PostgresStateStore;
use crate::upstream::UpstreamClient;
use crate::workers::backfill::BackfillWorker;

#[derive(Clone)]
pub struct AppState {
    pub config: LakeConfig,
    pub db: PgPool,
    pub hot: Arc<PostgresHotStore>,
    pub cold: Arc<FsColdStore>,
    pub state_store: Arc<PostgresStateStore>,
    pub upstream: UpstreamClient,
    pub backfill_worker: Arc<BackfillWorker<FsColdStore, PostgresStateStore>>,
}

impl FromRef<AppState> for LakeConfig {
    fn from_ref(state: &AppState) -> LakeConfig {
        state.config.clone()
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
