mod cli;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sphere=info,warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run().await
}
