mod files;
mod reduce;
mod server;
mod shuffler;
mod udf;
mod worker;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker=debug,reqwest=info".into()),
        )
        .init();

    worker::run().await
}
