use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vitalslake::config::LakeConfig;
use vitalslake::store::cold::FsColdStore;
use vitalslake::store::hot::PostgresHotStore;
use vitalslake::store::state_store::PostgresStateStore;
use vitalslake::upstream::UpstreamClient;
use vitalslake::workers::archival::ArchivalWorker;
use vitalslake::workers::backfill::{self, BackfillWorker};
use vitalslake::workers::sync::SyncWorker;
use vitalslake::{cli, db, openapi, points, routes, state};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind vitalslake listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind vitalslake listener on {addr}")),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, cancelling background workers");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!("{}", serde_json::to_string_pretty(&openapi::openapi_json())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = LakeConfig::from_env()?;
    if let Some(host) = args.host {
        config.bind_host = host;
    }
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    let pool = db::connect_lazy(&config.database_url)?;
    points::ensure_schema(&pool).await?;

    let hot = Arc::new(PostgresHotStore::new(pool.clone()));
    hot.ensure_schema().await?;

    let state_store = Arc::new(PostgresStateStore::new(pool.clone()));
    state_store.ensure_schema().await?;

    let cold = Arc::new(FsColdStore::new(
        config.cold_root.clone(),
        config.tmp_root.clone(),
        config.cold_file_max_bytes,
    ));

    let upstream = UpstreamClient::new(&config)?;

    let backfill_worker = Arc::new(BackfillWorker::new(
        pool.clone(),
        cold.clone(),
        state_store.clone(),
        upstream.clone(),
        config.clone(),
    ));

    let app_state = state::AppState {
        config: config.clone(),
        db: pool.clone(),
        hot: hot.clone(),
        cold: cold.clone(),
        state_store: state_store.clone(),
        upstream: upstream.clone(),
        backfill_worker: backfill_worker.clone(),
    };

    match backfill::resume_incomplete_jobs(&backfill_worker).await {
        Ok(resumed) if resumed > 0 => {
            tracing::info!(resumed, "resumed incomplete backfill jobs after restart");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, "failed to scan state store for incomplete backfill jobs");
        }
    }

    let cancel = CancellationToken::new();
    for site in &config.sites {
        SyncWorker::new(
            site.clone(),
            pool.clone(),
            hot.clone(),
            state_store.clone(),
            upstream.clone(),
            config.clone(),
        )
        .start(cancel.clone());

        ArchivalWorker::new(
            site.clone(),
            pool.clone(),
            hot.clone(),
            cold.clone(),
            state_store.clone(),
            config.clone(),
        )
        .start(cancel.clone());
    }

    let app = routes::router(app_state);
    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "vitalslake listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        let message = err.to_string().to_lowercase();
        if message.contains("operation not permitted") {
            return Ok(());
        }

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
