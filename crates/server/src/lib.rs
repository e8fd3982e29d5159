//! HTTP surface of murmur: chat CRUD plus streamed replies over server-sent events.

use std::sync::Arc;

use murmur_core::ChatOrchestrator;
use murmur_storage::SqliteStorage;
use snafu::ResultExt;
use tokio::net::TcpListener;

pub mod config;
pub mod error;
pub mod routes;
pub mod transport;

pub use config::{LlmSettings, ServerConfig};
pub use error::{ApiError, ServerError, ServerResult};
pub use routes::{AppState, router};

use error::{BindSnafu, CreateProviderSnafu, OpenStoreSnafu, ServeSnafu};

pub const DEFAULT_LOG_FILTER: &str = "info,murmur=debug";

/// Opens the store and the model provider described by `config`.
pub async fn build_state(config: &ServerConfig) -> ServerResult<AppState> {
    let store = SqliteStorage::open(&config.database_path)
        .await
        .context(OpenStoreSnafu {
            stage: "build-state-open-store",
        })?;
    let provider =
        murmur_llm::create_provider(config.llm.to_provider_config()).context(CreateProviderSnafu {
            stage: "build-state-create-provider",
        })?;

    tracing::info!(
        provider_id = %provider.id(),
        model = %provider.default_model(),
        database = %store.database_url(),
        "murmur state ready"
    );

    Ok(AppState::new(ChatOrchestrator::new(Arc::new(store), provider)))
}

pub async fn serve(listener: TcpListener, state: AppState) -> ServerResult<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu {
            stage: "serve-http",
        })
}

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let state = build_state(&config).await?;
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .context(BindSnafu {
            stage: "run-bind",
            address: config.bind_address.clone(),
        })?;

    let local_address = listener
        .local_addr()
        .map(|address| address.to_string())
        .unwrap_or_else(|_| config.bind_address.clone());
    tracing::info!(address = %local_address, "murmur listening");

    serve(listener, state).await
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
