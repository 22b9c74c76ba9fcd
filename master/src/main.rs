mod handlers;
mod monitor;
mod state;

use anyhow::Result;
use common::config::env_or;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::AppState;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_WORKER_DEAD_TIMEOUT_SECS: u64 = 20;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "master=debug,tower_http=info,axum=info".into()),
        )
        .init();

    let bind = env_or("MASTER_BIND", DEFAULT_BIND.to_string());
    let dead_timeout = Duration::from_secs(env_or(
        "WORKER_DEAD_TIMEOUT_SECS",
        DEFAULT_WORKER_DEAD_TIMEOUT_SECS,
    ));

    let state = AppState::new(dead_timeout);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state).await;
    });

    let listener = TcpListener::bind(&bind).await?;
    info!(
        "master escuchando en {} (timeout de workers {:?})",
        listener.local_addr()?,
        dead_timeout
    );

    axum::serve(listener, app).await?;
    Ok(())
}
