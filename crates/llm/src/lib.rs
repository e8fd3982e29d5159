//! Language-model gateway.
//!
//! A provider turns a role-tagged history into a [`ProviderEventStream`] of text
//! deltas that ends with exactly one `Done` or `Error`. Backend failures are
//! classified into [`murmur_protocol::ErrorCategory`] before they leave this crate.

use std::sync::Arc;

mod classify;
mod provider;
mod rig_adapter;
#[cfg(feature = "scripted")]
pub mod scripted;

pub use classify::{classify_detail, error_chain_text};
pub use provider::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_PERSONA, GatewayFailure, LlmProvider,
    ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, STREAM_CHANNEL_CAPACITY, StreamEventPayload,
    StreamRequest, make_event_stream, with_persona,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
