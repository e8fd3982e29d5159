use std::process::ExitCode;

use murmur_server::{DEFAULT_LOG_FILTER, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let result = match ServerConfig::load() {
        Ok(config) => murmur_server::run(config).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "murmur stopped");
            ExitCode::FAILURE
        }
    }
}
