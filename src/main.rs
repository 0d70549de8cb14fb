use clap::Parser;
use llamachat::app::{self, AppBuilder};
use llamachat::config::{Config, DEFAULT_LOG_FILTER};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<(), app::Error> {
    let config = Config::parse();

    let filter = match &config.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("llamachat {}", env!("CARGO_PKG_VERSION"));

    AppBuilder::new(config).run().await
}
